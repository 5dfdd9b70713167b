//! One host's pending URIs, its lifecycle state and its budget.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::models::CrawlUri;
use crate::queue_store::{PendingUriStore, QueueStore, StoreError, StoreKey, class_fingerprint};
use crate::spill_queue::MemoryQueue;

/// Lifecycle of a work queue.
///
/// ```text
/// INACTIVE -> READY <-> IN_PROCESS
/// READY/EMPTY -> SNOOZED -> READY/EMPTY
/// READY/EMPTY -> FROZEN -> INACTIVE      (operator)
/// READY/EMPTY -> DISCARDED               (terminal, empty only)
/// INACTIVE -> RETIRED -> INACTIVE        (budget, config change)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Inactive,
    Ready,
    InProcess,
    Empty,
    Snoozed,
    Frozen,
    Retired,
    Discarded,
}

impl QueueState {
    pub fn can_transition_to(self, to: QueueState) -> bool {
        use QueueState::*;
        match (self, to) {
            (Inactive, Ready | Empty | Retired | Snoozed) => true,
            (Ready, InProcess | Empty | Snoozed | Inactive | Frozen | Discarded) => true,
            (Empty, Ready | Inactive | Snoozed | Frozen | Discarded) => true,
            (InProcess, Ready | Empty | Snoozed | Inactive) => true,
            (Snoozed, Ready | Empty | Inactive) => true,
            (Frozen, Inactive) => true,
            (Retired, Inactive) => true,
            _ => false,
        }
    }
}

enum Backing {
    Memory(MemoryQueue),
    Stored(Arc<PendingUriStore>),
}

/// Counters a queue accumulates over the crawl; kept across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueTallies {
    pub enqueued: u64,
    pub emitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub disregarded: u64,
    pub errors: u64,
}

pub struct WorkQueue {
    class_key: String,
    class_fp: u64,
    state: QueueState,
    /// Member of one of the scheduler's pools (or out with a worker).
    held: bool,
    count: u64,
    backing: Backing,
    checked_out: BTreeSet<StoreKey>,
    valence: usize,
    wake_time_ms: u64,
    session_balance: i64,
    total_budget: i64,
    total_expenditure: i64,
    pub tallies: QueueTallies,
}

impl WorkQueue {
    pub fn new(class_key: &str, store: &QueueStore) -> Self {
        let class_fp = class_fingerprint(class_key);
        let backing = match store {
            QueueStore::Memory {
                head_capacity,
                spill_dir,
            } => Backing::Memory(MemoryQueue::new(
                *head_capacity,
                spill_dir
                    .as_ref()
                    .map(|dir| dir.join(format!("{:016x}.spill", class_fp))),
            )),
            QueueStore::Persistent(store) => Backing::Stored(Arc::clone(store)),
        };

        Self {
            class_key: class_key.to_string(),
            class_fp,
            state: QueueState::Inactive,
            held: false,
            count: 0,
            backing,
            checked_out: BTreeSet::new(),
            valence: 1,
            wake_time_ms: 0,
            session_balance: 0,
            total_budget: -1,
            total_expenditure: 0,
            tallies: QueueTallies::default(),
        }
    }

    /// Rebuild a persistent queue's bookkeeping from a checkpoint; the records
    /// themselves are already in the store.
    pub fn restore(
        class_key: &str,
        store: &QueueStore,
        snapshot: &QueueSnapshot,
    ) -> Result<Self, StoreError> {
        let mut wq = Self::new(class_key, store);
        wq.count = match &wq.backing {
            Backing::Stored(pending) => pending.count_class(wq.class_fp)?,
            Backing::Memory(_) => 0,
        };
        wq.wake_time_ms = snapshot.wake_time_ms;
        wq.session_balance = snapshot.session_balance;
        wq.total_budget = snapshot.total_budget;
        wq.total_expenditure = snapshot.total_expenditure;
        wq.tallies = snapshot.tallies.clone();
        Ok(wq)
    }

    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    pub fn class_fingerprint(&self) -> u64 {
        self.class_fp
    }

    // ========================================================================
    // STATE
    // ========================================================================

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Move to `to`. Illegal transitions are bugs in the scheduler.
    pub fn transition(&mut self, to: QueueState) {
        assert!(
            self.state.can_transition_to(to),
            "illegal work queue transition {:?} -> {:?} for {}",
            self.state,
            to,
            self.class_key
        );
        tracing::trace!(target: "frontier", queue = %self.class_key, from = ?self.state, to = ?to, "queue transition");
        self.state = to;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn set_held(&mut self) {
        self.held = true;
    }

    pub fn clear_held(&mut self) {
        self.held = false;
    }

    pub fn set_valence(&mut self, valence: usize) {
        self.valence = valence.max(1);
    }

    pub fn valence(&self) -> usize {
        self.valence
    }

    pub fn in_process(&self) -> usize {
        self.checked_out.len()
    }

    /// No further URI may be handed out until one comes back.
    pub fn is_busy(&self) -> bool {
        self.checked_out.len() >= self.valence
    }

    pub fn is_checked_out(&self, key: &StoreKey) -> bool {
        self.checked_out.contains(key)
    }

    pub fn wake_time_ms(&self) -> u64 {
        self.wake_time_ms
    }

    pub fn set_wake_time_ms(&mut self, wake_time_ms: u64) {
        self.wake_time_ms = wake_time_ms;
    }

    /// Empty, idle and not parked anywhere that expects it to come back.
    pub fn is_discardable(&self) -> bool {
        self.count == 0
            && self.checked_out.is_empty()
            && !self.held
            && matches!(self.state, QueueState::Empty | QueueState::Ready)
    }

    // ========================================================================
    // CONTENTS
    // ========================================================================

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a record. The caller has set `ordinal`, `cost` and `class_key`;
    /// the holder key is derived here.
    pub fn enqueue(&mut self, curi: &mut CrawlUri) -> Result<(), StoreError> {
        let key = StoreKey::new(
            self.class_fp,
            curi.directive,
            curi.cost.unwrap_or(1),
            curi.ordinal,
        );
        curi.holder_key = Some(key);
        curi.class_key = Some(self.class_key.clone());

        match &mut self.backing {
            Backing::Memory(queue) => queue.insert(key, curi.clone())?,
            Backing::Stored(store) => store.put(curi)?,
        }
        self.count += 1;
        self.tallies.enqueued += 1;
        Ok(())
    }

    /// Next record that is not already out with a worker.
    pub fn peek(&mut self) -> Result<Option<CrawlUri>, StoreError> {
        match &mut self.backing {
            Backing::Memory(queue) => queue.first_available(&self.checked_out),
            Backing::Stored(store) => store.first_in_class(self.class_fp, &self.checked_out),
        }
    }

    /// Hide a record from `peek` while a worker has it.
    pub fn check_out(&mut self, key: StoreKey) {
        self.checked_out.insert(key);
        self.tallies.emitted += 1;
    }

    /// Make a record visible again. Returns false if it was not checked out.
    pub fn check_in(&mut self, key: &StoreKey) -> bool {
        self.checked_out.remove(key)
    }

    /// Remove a record for good.
    pub fn dequeue(&mut self, key: &StoreKey) -> Result<bool, StoreError> {
        let removed = match &mut self.backing {
            Backing::Memory(queue) => queue.remove(key).is_some(),
            Backing::Stored(store) => store.delete(key)?,
        };
        if removed {
            self.count = self.count.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Rewrite a record in place, keeping its position.
    pub fn update(&mut self, curi: &CrawlUri) -> Result<(), StoreError> {
        match &mut self.backing {
            Backing::Memory(queue) => {
                if !queue.update(curi.clone()) {
                    return Err(StoreError::MissingKey(curi.uri.clone()));
                }
                Ok(())
            }
            Backing::Stored(store) => store.put(curi),
        }
    }

    /// Move a record to the position its (changed) directive and new ordinal call for.
    pub fn reposition(&mut self, old_key: &StoreKey, curi: &mut CrawlUri) -> Result<(), StoreError> {
        let key = StoreKey::new(
            self.class_fp,
            curi.directive,
            curi.cost.unwrap_or(1),
            curi.ordinal,
        );
        curi.holder_key = Some(key);
        match &mut self.backing {
            Backing::Memory(queue) => {
                queue.remove(old_key);
                queue.insert(key, curi.clone())
            }
            Backing::Stored(store) => store.replace(old_key, curi),
        }
    }

    /// Remove every waiting record matching `pred`. Records out with workers are left alone.
    pub fn remove_matching<F>(&mut self, pred: F) -> Result<Vec<CrawlUri>, StoreError>
    where
        F: FnMut(&CrawlUri) -> bool,
    {
        let removed = match &mut self.backing {
            Backing::Memory(queue) => queue.remove_matching(&self.checked_out, pred)?,
            Backing::Stored(store) => {
                let mut pred = pred;
                let doomed: Vec<CrawlUri> = store
                    .scan_class(self.class_fp)?
                    .into_iter()
                    .filter(|c| c.holder_key.is_some_and(|k| !self.checked_out.contains(&k)))
                    .filter(|c| pred(c))
                    .collect();
                for curi in &doomed {
                    if let Some(key) = curi.holder_key {
                        store.delete(&key)?;
                    }
                }
                doomed
            }
        };
        self.count = self.count.saturating_sub(removed.len() as u64);
        Ok(removed)
    }

    // ========================================================================
    // BUDGET
    // ========================================================================

    pub fn session_balance(&self) -> i64 {
        self.session_balance
    }

    pub fn total_budget(&self) -> i64 {
        self.total_budget
    }

    pub fn total_expenditure(&self) -> i64 {
        self.total_expenditure
    }

    pub fn set_total_budget(&mut self, budget: i64) {
        self.total_budget = budget;
    }

    pub fn replenish(&mut self, amount: i64) {
        self.session_balance = amount;
    }

    /// Charge the cost of one emission.
    pub fn expend(&mut self, cost: u32) {
        self.session_balance -= cost as i64;
        self.total_expenditure += cost as i64;
    }

    /// Charge a penalty for a final failure.
    pub fn note_error(&mut self, penalty: i64) {
        self.session_balance -= penalty;
        self.tallies.errors += 1;
    }

    /// Session balance spent, or lifetime budget (when not -1) reached.
    pub fn is_over_budget(&self) -> bool {
        self.session_balance <= 0 || self.is_over_total_budget()
    }

    pub fn is_over_total_budget(&self) -> bool {
        self.total_budget >= 0 && self.total_expenditure >= self.total_budget
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            class_key: self.class_key.clone(),
            state: self.state,
            count: self.count,
            wake_time_ms: self.wake_time_ms,
            session_balance: self.session_balance,
            total_budget: self.total_budget,
            total_expenditure: self.total_expenditure,
            tallies: self.tallies.clone(),
        }
    }

    /// One-line description for reports.
    pub fn report_line(&self) -> String {
        format!(
            "{} {:?} count={} in_process={}/{} balance={} spent={}/{} wake={}",
            self.class_key,
            self.state,
            self.count,
            self.checked_out.len(),
            self.valence,
            self.session_balance,
            self.total_expenditure,
            self.total_budget,
            self.wake_time_ms
        )
    }
}

/// Queue bookkeeping written into a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub class_key: String,
    pub state: QueueState,
    pub count: u64,
    pub wake_time_ms: u64,
    pub session_balance: i64,
    pub total_budget: i64,
    pub total_expenditure: i64,
    pub tallies: QueueTallies,
}
