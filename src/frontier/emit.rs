use std::sync::atomic::Ordering;
use std::time::Duration;

use super::finish::rest;
use super::{Frontier, FrontierError};
use crate::config::Config;
use crate::models::{CrawlUri, now_ms};
use crate::queue_store::StoreError;
use crate::work_queue::{QueueState, WorkQueue};

impl Frontier {
    /// Hand out the next URI to fetch.
    ///
    /// Blocks while paused and while every queue is resting. Returns
    /// `Ok(None)` once nothing is queued, out with a worker or waiting in the
    /// dedup filter, and `Err(FrontierError::Ended)` after `terminate`.
    pub fn next(&self) -> Result<Option<CrawlUri>, FrontierError> {
        loop {
            let (woken, activated, candidate, taken) = {
                let mut pools = self.pools.lock();
                loop {
                    if pools.terminated {
                        return Err(FrontierError::Ended);
                    }
                    if !pools.paused {
                        break;
                    }
                    self.wakeup
                        .wait_for(&mut pools, Duration::from_millis(Config::DEFAULT_WAIT_MS));
                }

                let woken = pools.take_woken(now_ms());
                let activated = if pools.ready.is_empty() && woken.is_empty() {
                    pools.inactive.pop_front()
                } else {
                    None
                };
                let candidate = pools.ready.pop_front();
                // Keys popped here are in no pool until handled; count them
                // so a concurrent caller cannot mistake that for exhaustion.
                let taken = woken.len() + usize::from(activated.is_some()) + usize::from(candidate.is_some());
                self.in_flight.fetch_add(taken as u64, Ordering::AcqRel);
                (woken, activated, candidate, taken)
            };

            for key in &woken {
                self.wake(key);
            }
            if let Some(key) = &activated {
                self.activate(key);
            }
            let emitted = match &candidate {
                Some(key) => self.try_emit(key),
                None => Ok(None),
            };
            self.in_flight.fetch_sub(taken as u64, Ordering::AcqRel);

            if taken > 0 {
                self.wakeup.notify_all();
                if let Some(curi) = emitted? {
                    self.enforce_bandwidth();
                    return Ok(Some(curi));
                }
                continue;
            }
            if self.uniq.flush(self) > 0 {
                continue;
            }

            let mut pools = self.pools.lock();
            if pools.terminated {
                return Err(FrontierError::Ended);
            }
            if pools.paused || !pools.ready.is_empty() || !pools.inactive.is_empty() {
                continue;
            }
            if pools.snoozed.is_empty()
                && self.in_flight.load(Ordering::Acquire) == 0
                && self.feeders.load(Ordering::Acquire) == 0
                && self.uniq.pending() == 0
            {
                return Ok(None);
            }

            let wait_ms = pools
                .next_wake_ms()
                .map(|wake| wake.saturating_sub(now_ms()))
                .unwrap_or(Config::DEFAULT_WAIT_MS)
                .clamp(1, Config::DEFAULT_WAIT_MS);
            self.wakeup.wait_for(&mut pools, Duration::from_millis(wait_ms));
        }
    }

    /// Try to take one URI from a queue popped off the ready pool.
    fn try_emit(&self, key: &str) -> Result<Option<CrawlUri>, FrontierError> {
        let Some(queue) = self.queue(key) else {
            return Ok(None);
        };
        let settings = self.settings_for(key);
        let (hold, snooze_deactivate_ms) = {
            let config = self.config.read();
            (config.hold_queues, config.snooze_deactivate_ms)
        };

        let mut wq = queue.lock();
        if wq.state() != QueueState::Ready {
            return Ok(None);
        }
        wq.set_valence(settings.host_valence);
        wq.set_total_budget(settings.queue_total_budget);

        if wq.is_over_total_budget() {
            self.retire(&mut wq);
            return Ok(None);
        }
        let now = now_ms();
        if wq.wake_time_ms() > now {
            rest(&mut wq, &mut self.pools.lock(), now, snooze_deactivate_ms);
            tracing::trace!(target: "frontier", queue = %key, wake_ms = wq.wake_time_ms(), "resting");
            return Ok(None);
        }
        if wq.is_over_budget() {
            if hold {
                wq.transition(QueueState::Inactive);
                self.pools.lock().inactive.push_back(key.to_string());
                tracing::debug!(target: "frontier", queue = %key, "session balance spent, deactivated");
                return Ok(None);
            }
            wq.replenish(settings.balance_replenish_amount);
        }

        let curi = match wq.peek() {
            Ok(Some(curi)) => curi,
            Ok(None) => {
                if wq.in_process() > 0 {
                    wq.transition(QueueState::InProcess);
                } else {
                    wq.transition(QueueState::Empty);
                    wq.clear_held();
                }
                return Ok(None);
            }
            Err(e) => {
                // Keep the queue in rotation; the store may recover.
                self.pools.lock().ready.push_back(key.to_string());
                return Err(e.into());
            }
        };
        let holder_key = curi
            .holder_key
            .ok_or_else(|| StoreError::MissingKey(curi.uri.clone()))?;

        if let Some(current) = self.class_key_for(&curi)
            && current != wq.class_key()
        {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let moved = wq.dequeue(&holder_key);
            self.pools.lock().ready.push_front(key.to_string());
            drop(wq);

            let result = match moved {
                Ok(_) => {
                    self.ctx.metrics.queued.dec();
                    tracing::debug!(target: "frontier", uri = %curi.uri, from = %key, to = %current, "re-routing");
                    let mut curi = curi;
                    curi.holder_key = None;
                    curi.ordinal = self.next_ordinal();
                    self.send_to_queue(&current, curi);
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.wakeup.notify_all();
            return result;
        }

        wq.check_out(holder_key);
        wq.expend(curi.cost.unwrap_or(1));
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        {
            let mut pools = self.pools.lock();
            if wq.is_busy() {
                wq.transition(QueueState::InProcess);
            } else {
                pools.ready.push_back(key.to_string());
            }
        }
        drop(wq);

        self.ctx.metrics.emitted.inc();
        if let Some(journal) = &self.journal {
            journal.emitted(&curi.uri);
        }
        Ok(Some(curi))
    }

    /// Re-file a snoozed queue whose wake time has passed.
    fn wake(&self, key: &str) {
        let Some(queue) = self.queue(key) else {
            return;
        };
        let hold = self.config.read().hold_queues;
        let mut wq = queue.lock();
        if wq.state() != QueueState::Snoozed {
            return;
        }

        let mut pools = self.pools.lock();
        if wq.is_empty() {
            wq.transition(QueueState::Empty);
            wq.clear_held();
        } else if hold && wq.is_over_budget() {
            wq.transition(QueueState::Inactive);
            pools.inactive.push_back(key.to_string());
        } else {
            wq.transition(QueueState::Ready);
            pools.ready.push_back(key.to_string());
        }
    }

    /// Bring a queue out of the inactive pool: retire it if over its total
    /// budget, otherwise top up its session balance and make it ready (or
    /// snooze it if it is still resting).
    fn activate(&self, key: &str) {
        let Some(queue) = self.queue(key) else {
            return;
        };
        let settings = self.settings_for(key);
        let mut wq = queue.lock();
        if wq.state() != QueueState::Inactive {
            return;
        }
        wq.set_valence(settings.host_valence);
        wq.set_total_budget(settings.queue_total_budget);
        if wq.is_over_total_budget() {
            self.retire(&mut wq);
            return;
        }
        wq.replenish(settings.balance_replenish_amount);

        let mut pools = self.pools.lock();
        if wq.is_empty() {
            wq.transition(QueueState::Empty);
            wq.clear_held();
        } else if wq.wake_time_ms() > now_ms() {
            wq.transition(QueueState::Snoozed);
            pools.snoozed.insert((wq.wake_time_ms(), key.to_string()));
        } else {
            wq.transition(QueueState::Ready);
            pools.ready.push_back(key.to_string());
        }
    }

    /// Move a queue to the retired pool. Its URIs stay queued.
    pub(crate) fn retire(&self, wq: &mut WorkQueue) {
        if wq.state() != QueueState::Inactive {
            wq.transition(QueueState::Inactive);
        }
        wq.transition(QueueState::Retired);
        self.pools.lock().retired.insert(wq.class_key().to_string());
        tracing::info!(
            "Retired queue {} after spending {} of budget {}",
            wq.class_key(),
            wq.total_expenditure(),
            wq.total_budget()
        );
    }

    fn enforce_bandwidth(&self) {
        let max_kbps = self.config.read().max_overall_bandwidth_kbps;
        let slept = self
            .throttle
            .enforce(max_kbps, self.ctx.metrics.total_bytes.get());
        if !slept.is_zero() {
            tracing::debug!(target: "frontier", slept_ms = slept.as_millis() as u64, "bandwidth throttle");
        }
    }
}
