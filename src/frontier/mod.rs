//! The scheduler: one work queue per class key, rotated through ready,
//! snoozed, inactive and retired pools.
//!
//! Locking: a queue's own mutex is always taken before the pools mutex, never
//! after. Host records and the config lock are leaves. Code that pops keys out
//! of the pools releases the pools lock before locking the queues it popped.

mod checkpoint;
mod emit;
mod finish;
mod pools;
mod stats;

pub use checkpoint::{CheckpointTotals, FrontierCheckpoint};
pub use stats::FrontierStats;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::config::{ConfigError, FrontierConfig, HostSettings, QueueAssignment, QueueStoreKind};
use crate::context::CrawlContext;
use crate::journal::{JournalError, RecoveryJournal};
use crate::models::{CrawlUri, SchedulingDirective, now_ms, status};
use crate::politeness::BandwidthThrottle;
use crate::queue_store::{PendingUriStore, QueueStore, StoreError};
use crate::seeder::SeedSource;
use crate::uniq::{UniqError, UniqFilter, UriReceiver};
use crate::url_utils::{canonicalize, host_key};
use crate::work_queue::{QueueSnapshot, QueueState, WorkQueue};
use pools::Pools;

#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("Crawl ended")]
    Ended,

    #[error("URI is not checked out from this frontier: {0}")]
    NotInProcess(String),

    #[error("Checkpoints need the persistent queue store")]
    CheckpointUnsupported,

    #[error("No checkpoint found at {0}")]
    NoCheckpoint(PathBuf),

    #[error("Queue store under {0} already holds pending URIs; resume from its checkpoint instead")]
    StaleState(PathBuf),

    #[error("Persistent component configured but the crawl context has no database")]
    MissingDatabase,

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dedup filter error: {0}")]
    Uniq(#[from] UniqError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),
}

pub(crate) type SharedQueue = Arc<Mutex<WorkQueue>>;

pub struct Frontier {
    config: RwLock<FrontierConfig>,
    ctx: CrawlContext,
    store: QueueStore,
    uniq: UniqFilter,
    journal: Option<RecoveryJournal>,
    queues: DashMap<String, SharedQueue>,
    pools: Mutex<Pools>,
    wakeup: Condvar,
    ordinal: AtomicU64,
    /// URIs handed to workers (or being moved between queues) and not yet re-filed.
    in_flight: AtomicU64,
    /// Threads feeding the frontier from outside, such as a journal replay.
    feeders: AtomicU64,
    throttle: BandwidthThrottle,
    promoted_seeds: Mutex<Vec<String>>,
}

impl Frontier {
    /// Start a fresh frontier. A persistent store that already holds pending
    /// URIs belongs to an earlier crawl and must be resumed instead.
    pub fn new(config: FrontierConfig, ctx: CrawlContext) -> Result<Self, FrontierError> {
        config.validate()?;
        let store = Self::open_store(&config, &ctx)?;
        if let Some(pending) = store.pending_store()
            && !pending.is_empty()?
        {
            return Err(FrontierError::StaleState(ctx.data_dir().to_path_buf()));
        }
        Self::assemble(config, ctx, store)
    }

    fn open_store(config: &FrontierConfig, ctx: &CrawlContext) -> Result<QueueStore, FrontierError> {
        match config.queue_store {
            QueueStoreKind::Memory => Ok(QueueStore::Memory {
                head_capacity: config.memory_head_capacity,
                spill_dir: Some(ctx.spill_dir()),
            }),
            QueueStoreKind::Persistent => {
                let db = ctx.database().cloned().ok_or(FrontierError::MissingDatabase)?;
                Ok(QueueStore::Persistent(Arc::new(PendingUriStore::new(db)?)))
            }
        }
    }

    fn assemble(config: FrontierConfig, ctx: CrawlContext, store: QueueStore) -> Result<Self, FrontierError> {
        let uniq = UniqFilter::new(config.uniq_filter, ctx.database().cloned(), config.uniq_batch_size)?;
        let journal = if config.journal {
            Some(RecoveryJournal::open(ctx.journal_path())?)
        } else {
            None
        };
        let pools = Pools {
            paused: config.pause_at_start,
            ..Default::default()
        };

        tracing::info!(
            "Frontier ready: store={:?} uniq={:?} assignment={:?} cost={:?}",
            config.queue_store,
            config.uniq_filter,
            config.queue_assignment,
            config.cost_policy
        );

        Ok(Self {
            config: RwLock::new(config),
            ctx,
            store,
            uniq,
            journal,
            queues: DashMap::new(),
            pools: Mutex::new(pools),
            wakeup: Condvar::new(),
            ordinal: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            feeders: AtomicU64::new(0),
            throttle: BandwidthThrottle::new(),
            promoted_seeds: Mutex::new(Vec::new()),
        })
    }

    // ========================================================================
    // SCHEDULING
    // ========================================================================

    /// Offer a URI. It reaches a work queue only if its canonical form is new
    /// (or it is force-fetched).
    pub fn schedule(&self, mut curi: CrawlUri) {
        let Some(canonical) = canonicalize(&curi.uri) else {
            tracing::warn!("Dropping unparsable URI {}", curi.uri);
            return;
        };
        curi.uri = canonical.clone();
        self.apply_preferences(&mut curi);

        if curi.force_fetch || Self::is_self_redirect(&curi, &canonical) {
            curi.force_fetch = true;
            self.uniq.add_force(&canonical, curi, self);
        } else {
            self.uniq.add(&canonical, curi, self);
        }
    }

    /// Schedule every seed of `source` at MEDIUM. Returns how many were offered.
    pub fn load_seeds(&self, source: &dyn SeedSource) -> usize {
        let mut offered = 0;
        for seed in source.seeds() {
            match seed {
                Ok(uri) => {
                    self.schedule(CrawlUri::seed(uri).with_directive(SchedulingDirective::Medium));
                    offered += 1;
                }
                Err(e) => tracing::warn!("Seed source {} error: {}", source.name(), e),
            }
        }
        self.uniq.flush(self);
        tracing::info!("Loaded {} seeds from {}", offered, source.name());
        offered
    }

    fn apply_preferences(&self, curi: &mut CrawlUri) {
        // A seed with a via can only be the target of a seed redirect.
        if curi.is_seed && curi.via.as_deref().is_some_and(|v| !v.is_empty()) {
            tracing::info!("Promoting seed redirect {} to seed", curi.uri);
            self.promoted_seeds.lock().push(curi.uri.clone());
            if curi.directive == SchedulingDirective::Normal {
                curi.directive = SchedulingDirective::Medium;
            }
        }

        let preference_hops = self.config.read().preference_embed_hops;
        if curi.directive == SchedulingDirective::Normal && preference_hops > 0 {
            let hops = curi.embed_hops();
            if hops > 0 && hops <= preference_hops {
                curi.directive = SchedulingDirective::Medium;
            }
        }
    }

    fn is_self_redirect(curi: &CrawlUri, canonical: &str) -> bool {
        curi.last_hop() == Some('R')
            && curi
                .via
                .as_deref()
                .and_then(canonicalize)
                .is_some_and(|via| via == canonical)
    }

    /// A URI that passed the dedup filter: give it an ordinal and a cost and
    /// put it on its queue.
    fn receive_uri(&self, mut curi: CrawlUri) {
        let Some(class_key) = self.class_key_for(&curi) else {
            self.unqueueable(curi, "no host to queue under");
            return;
        };

        let policy = self.config.read().cost_policy;
        policy.assign(&mut curi);
        curi.ordinal = self.next_ordinal();
        if let Some(journal) = &self.journal {
            journal.added(&curi);
        }
        self.send_to_queue(&class_key, curi);
    }

    pub(crate) fn send_to_queue(&self, class_key: &str, mut curi: CrawlUri) {
        loop {
            let queue = self.queue_for(class_key);
            let mut wq = queue.lock();
            if wq.state() == QueueState::Discarded {
                // Lost a race with discard_empty_queues; the map entry is gone.
                continue;
            }

            if let Err(e) = wq.enqueue(&mut curi) {
                drop(wq);
                self.unqueueable(curi, &e.to_string());
                return;
            }
            self.ctx.metrics.queued.inc();
            if !wq.is_held() {
                self.file_new_work(&mut wq);
            }
            return;
        }
    }

    /// Put a queue that just received work (and sat in no pool) into rotation.
    fn file_new_work(&self, wq: &mut WorkQueue) {
        let hold = self.config.read().hold_queues;
        let now = now_ms();
        wq.set_held();

        let mut pools = self.pools.lock();
        if wq.wake_time_ms() > now {
            // Still resting after its last fetch.
            wq.transition(QueueState::Snoozed);
            pools
                .snoozed
                .insert((wq.wake_time_ms(), wq.class_key().to_string()));
        } else if hold {
            if wq.state() != QueueState::Inactive {
                wq.transition(QueueState::Inactive);
            }
            pools.inactive.push_back(wq.class_key().to_string());
        } else {
            wq.transition(QueueState::Ready);
            pools.ready.push_back(wq.class_key().to_string());
        }
        drop(pools);
        self.wakeup.notify_all();
    }

    /// Finalize a URI that could not be put on any queue.
    fn unqueueable(&self, mut curi: CrawlUri, reason: &str) {
        tracing::error!("Cannot queue {}: {}", curi.uri, reason);
        curi.fetch_status = status::UNQUEUEABLE;
        curi.localized_errors.push(reason.to_string());
        self.ctx.metrics.failed.inc();
        if let Some(journal) = &self.journal {
            journal.error(&format!("unqueueable {} {}", curi.uri, reason));
            journal.failed(&curi.uri);
        }
        tracing::info!(
            target: "uri_processing",
            uri = %curi.uri,
            status = curi.fetch_status,
            disposition = "failed",
            reason,
            "unqueueable"
        );
        curi.strip_to_minimal();
    }

    /// The key of the queue `curi` belongs in right now.
    pub(crate) fn class_key_for(&self, curi: &CrawlUri) -> Option<String> {
        let host = host_key(&curi.uri)?;
        let (forced, assignment) = {
            let config = self.config.read();
            (config.settings_for(&host).force_queue, config.queue_assignment)
        };
        if let Some(forced) = forced {
            return Some(forced);
        }
        match assignment {
            QueueAssignment::Hostname => Some(host),
            QueueAssignment::Ip => Some(
                self.ctx
                    .server_cache
                    .address_for(&host, now_ms())
                    .map(|ip| ip.to_string())
                    .unwrap_or(host),
            ),
        }
    }

    fn queue_for(&self, class_key: &str) -> SharedQueue {
        if let Some(queue) = self.queues.get(class_key) {
            return queue.value().clone();
        }

        let settings = self.settings_for(class_key);
        self.queues
            .entry(class_key.to_string())
            .or_insert_with(|| {
                let mut wq = WorkQueue::new(class_key, &self.store);
                wq.set_valence(settings.host_valence);
                wq.set_total_budget(settings.queue_total_budget);
                wq.replenish(settings.balance_replenish_amount);
                tracing::debug!(target: "frontier", queue = %class_key, "created work queue");
                Arc::new(Mutex::new(wq))
            })
            .value()
            .clone()
    }

    pub(crate) fn queue(&self, class_key: &str) -> Option<SharedQueue> {
        self.queues.get(class_key).map(|q| q.value().clone())
    }

    /// Every queue, collected so no map lock is held while they are locked.
    pub(crate) fn all_queues(&self) -> Vec<SharedQueue> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }

    pub(crate) fn settings_for(&self, key: &str) -> HostSettings {
        self.config.read().settings_for(key)
    }

    pub(crate) fn next_ordinal(&self) -> u64 {
        self.ordinal.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // DEDUP PASSTHROUGH
    // ========================================================================

    /// Mark a URI as already crawled without queueing it.
    pub fn consider_included(&self, uri: &str) {
        match canonicalize(uri) {
            Some(canonical) => self.uniq.note(&canonical),
            None => tracing::warn!("Cannot mark unparsable URI {} as included", uri),
        }
    }

    /// Let a URI be scheduled again.
    pub fn forget(&self, uri: &str) -> bool {
        canonicalize(uri).is_some_and(|canonical| self.uniq.forget(&canonical))
    }

    /// Deliver any URIs the dedup filter is still holding.
    pub fn flush(&self) -> usize {
        self.uniq.flush(self)
    }

    // ========================================================================
    // HOST RECORDS
    // ========================================================================

    pub fn note_resolved(&self, host: &str, ip: IpAddr, ttl_ms: u64) {
        self.ctx
            .server_cache
            .host_for(host)
            .lock()
            .note_resolved(ip, ttl_ms, now_ms());
    }

    pub fn note_robots(&self, host: &str, disallow_all: bool, ttl_ms: u64) {
        self.ctx
            .server_cache
            .host_for(host)
            .lock()
            .note_robots(disallow_all, ttl_ms, now_ms());
    }

    // ========================================================================
    // OPERATOR CONTROLS
    // ========================================================================

    /// Block every caller of `next` until `unpause`.
    pub fn pause(&self) {
        self.pools.lock().paused = true;
        tracing::info!("Frontier paused");
    }

    pub fn unpause(&self) {
        self.pools.lock().paused = false;
        self.wakeup.notify_all();
        tracing::info!("Frontier unpaused");
    }

    /// Make every blocked and future `next` call return `FrontierError::Ended`.
    pub fn terminate(&self) {
        self.pools.lock().terminated = true;
        self.wakeup.notify_all();
        tracing::info!("Frontier terminated");
    }

    pub fn is_paused(&self) -> bool {
        self.pools.lock().paused
    }

    pub fn is_terminated(&self) -> bool {
        self.pools.lock().terminated
    }

    /// Take a ready or empty queue out of rotation. Returns false if the queue
    /// does not exist or is in any other state.
    pub fn freeze_queue(&self, class_key: &str) -> bool {
        let Some(queue) = self.queue(class_key) else {
            return false;
        };
        let mut wq = queue.lock();
        if !matches!(wq.state(), QueueState::Ready | QueueState::Empty) {
            return false;
        }
        self.pools.lock().remove_ready(class_key);
        wq.transition(QueueState::Frozen);
        wq.set_held();
        tracing::info!("Froze queue {}", class_key);
        true
    }

    /// Return a frozen queue to the inactive pool.
    pub fn unfreeze_queue(&self, class_key: &str) -> bool {
        let Some(queue) = self.queue(class_key) else {
            return false;
        };
        let mut wq = queue.lock();
        if wq.state() != QueueState::Frozen {
            return false;
        }
        wq.transition(QueueState::Inactive);
        self.pools.lock().inactive.push_back(class_key.to_string());
        drop(wq);
        self.wakeup.notify_all();
        tracing::info!("Unfroze queue {}", class_key);
        true
    }

    /// Drop queues that hold nothing, have nothing out and are not resting.
    /// Returns how many were dropped.
    pub fn discard_empty_queues(&self) -> usize {
        let now = now_ms();
        let mut discarded = 0;
        for queue in self.all_queues() {
            let mut wq = queue.lock();
            if !wq.is_discardable() || wq.wake_time_ms() > now {
                continue;
            }
            wq.transition(QueueState::Discarded);
            let key = wq.class_key().to_string();
            self.queues.remove_if(&key, |_, q| Arc::ptr_eq(q, &queue));
            discarded += 1;
        }
        let reclaimed = self.ctx.server_cache.reclaim();
        tracing::info!("Discarded {} empty queues, reclaimed {} host records", discarded, reclaimed);
        discarded
    }

    /// Swap in a new configuration. Retired queues go back to the inactive
    /// pool so a raised budget takes effect; those still over budget stay retired.
    pub fn update_config(&self, config: FrontierConfig) -> Result<(), FrontierError> {
        config.validate()?;
        *self.config.write() = config;

        let retired: Vec<String> = std::mem::take(&mut self.pools.lock().retired)
            .into_iter()
            .collect();
        let mut restored = 0;
        for key in retired {
            let Some(queue) = self.queue(&key) else {
                continue;
            };
            let settings = self.settings_for(&key);
            let mut wq = queue.lock();
            wq.set_total_budget(settings.queue_total_budget);
            wq.set_valence(settings.host_valence);
            let mut pools = self.pools.lock();
            if wq.state() == QueueState::Retired && !wq.is_over_total_budget() {
                wq.transition(QueueState::Inactive);
                pools.inactive.push_back(key);
                restored += 1;
            } else {
                pools.retired.insert(key);
            }
        }
        self.wakeup.notify_all();
        tracing::info!("Configuration updated; {} retired queues restored", restored);
        Ok(())
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> FrontierConfig {
        self.config.read().clone()
    }

    pub fn context(&self) -> &CrawlContext {
        &self.ctx
    }

    pub fn journal(&self) -> Option<&RecoveryJournal> {
        self.journal.as_ref()
    }

    /// URIs on queues, including those out with workers.
    pub fn queued_uri_count(&self) -> u64 {
        self.ctx.metrics.queued.get().max(0) as u64
    }

    /// Distinct URIs the dedup filter has let in.
    pub fn discovered_uri_count(&self) -> u64 {
        self.uniq.count()
    }

    pub fn succeeded_fetch_count(&self) -> u64 {
        self.ctx.metrics.succeeded.get()
    }

    pub fn failed_fetch_count(&self) -> u64 {
        self.ctx.metrics.failed.get()
    }

    pub fn disregarded_uri_count(&self) -> u64 {
        self.ctx.metrics.disregarded.get()
    }

    pub fn is_empty(&self) -> bool {
        self.queued_uri_count() == 0
    }

    /// Seed redirect targets promoted to seeds so far.
    pub fn promoted_seeds(&self) -> Vec<String> {
        self.promoted_seeds.lock().clone()
    }

    pub fn queue_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn queue_snapshot(&self, class_key: &str) -> Option<QueueSnapshot> {
        self.queue(class_key).map(|q| q.lock().snapshot())
    }

    pub(crate) fn begin_feed(&self) {
        self.feeders.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_feed(&self) {
        self.feeders.fetch_sub(1, Ordering::AcqRel);
        self.wakeup.notify_all();
    }

    /// Flush the dedup filter, close the journal and sync the store.
    pub fn close(&self) -> Result<(), FrontierError> {
        self.uniq.flush(self);
        if let Some(journal) = &self.journal {
            journal.close()?;
        }
        if let Some(pending) = self.store.pending_store() {
            pending.sync()?;
        }
        tracing::info!("Frontier closed: {}", self.stats());
        Ok(())
    }
}

impl UriReceiver for Frontier {
    fn receive(&self, curi: CrawlUri) {
        self.receive_uri(curi);
    }
}
