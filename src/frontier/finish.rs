use regex::Regex;
use std::sync::atomic::Ordering;

use super::pools::Pools;
use super::{Frontier, FrontierError};
use crate::config::HostSettings;
use crate::models::{CrawlUri, Disposition, SchedulingDirective, now_ms, status};
use crate::politeness::politeness_delay_ms;
use crate::queue_store::StoreKey;
use crate::url_utils::host_key;
use crate::work_queue::{QueueState, WorkQueue};

/// Retried at once, at MEDIUM: deferred behind a prerequisite, or an auth
/// challenge now that credentials are loaded.
fn is_prompt_retry(curi: &CrawlUri) -> bool {
    curi.fetch_status == status::DEFERRED
        || (curi.fetch_status == status::HTTP_UNAUTHORIZED && curi.has_credentials)
}

fn needs_retry(curi: &CrawlUri, settings: &HostSettings) -> bool {
    if curi.fetch_attempts >= settings.max_retries {
        return false;
    }
    is_prompt_retry(curi) || status::is_transient(curi.fetch_status)
}

pub(crate) fn classify(curi: &CrawlUri, settings: &HostSettings) -> Disposition {
    let code = curi.fetch_status;
    if status::is_success(code) {
        Disposition::Succeeded
    } else if status::is_disregarded(code) {
        Disposition::Disregarded
    } else if needs_retry(curi, settings) {
        Disposition::Retried
    } else {
        Disposition::Failed
    }
}

/// Park a queue until its wake time. A long rest gives up the queue's place
/// to ready queues by going inactive instead of snoozing.
pub(super) fn rest(wq: &mut WorkQueue, pools: &mut Pools, now: u64, snooze_deactivate_ms: u64) {
    let key = wq.class_key().to_string();
    let remaining = wq.wake_time_ms().saturating_sub(now);
    if remaining > snooze_deactivate_ms && !pools.ready.is_empty() {
        wq.transition(QueueState::Inactive);
        pools.inactive.push_back(key);
    } else {
        wq.transition(QueueState::Snoozed);
        pools.snoozed.insert((wq.wake_time_ms(), key));
    }
}

impl Frontier {
    /// Take back a URI handed out by `next`, annotated by the fetcher.
    ///
    /// Calling this for a URI that is not currently checked out (for example
    /// a second time for the same URI) is a caller error and returns
    /// `FrontierError::NotInProcess` without touching any count.
    pub fn finished(&self, mut curi: CrawlUri) -> Result<Disposition, FrontierError> {
        let (Some(holder_key), Some(class_key)) = (curi.holder_key, curi.class_key.clone()) else {
            return Err(FrontierError::NotInProcess(curi.uri));
        };
        let Some(queue) = self.queue(&class_key) else {
            return Err(FrontierError::NotInProcess(curi.uri));
        };
        let host = host_key(&curi.uri).unwrap_or_else(|| class_key.clone());
        let settings = self.settings_for(&host);

        let mut wq = queue.lock();
        if !wq.check_in(&holder_key) {
            return Err(FrontierError::NotInProcess(curi.uri));
        }

        curi.fetch_attempts += 1;
        let metrics = &self.ctx.metrics;
        metrics.total_bytes.add(curi.content_size);
        if let Some(duration) = curi.fetch_duration_ms() {
            metrics.record_fetch_duration(duration);
        }
        for error in &curi.localized_errors {
            tracing::warn!(target: "local_errors", uri = %curi.uri, error = %error);
        }

        let result = self.dispose(&mut wq, &mut curi, holder_key, &host, &settings);
        let delay_ms = match &result {
            Ok((_, delay_ms)) => *delay_ms,
            Err(e) => {
                tracing::error!("Failed to re-file {} on {}: {}", curi.uri, class_key, e);
                0
            }
        };
        self.refile_after_finish(&mut wq, delay_ms);
        drop(wq);

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.wakeup.notify_all();
        curi.strip_to_minimal();
        result.map(|(disposition, _)| disposition)
    }

    /// Apply the outcome to the queue and counters. Returns the disposition
    /// and how long the queue should rest before its next emission.
    fn dispose(
        &self,
        wq: &mut WorkQueue,
        curi: &mut CrawlUri,
        holder_key: StoreKey,
        host: &str,
        settings: &HostSettings,
    ) -> Result<(Disposition, u64), FrontierError> {
        let metrics = &self.ctx.metrics;
        let disposition = classify(curi, settings);
        let now = now_ms();
        let politeness = {
            let record = self.ctx.server_cache.host_for(host);
            let mut record = record.lock();
            politeness_delay_ms(curi, settings, Some(&mut *record), now)
        };
        if politeness > 0 {
            metrics.record_politeness_delay(std::time::Duration::from_millis(politeness));
        }

        if disposition == Disposition::Retried {
            metrics.retried.inc();
            if let Some(journal) = &self.journal {
                journal.rescheduled(&curi.uri);
            }

            let delay_ms = if is_prompt_retry(curi) {
                curi.processing_cleanup();
                curi.directive = SchedulingDirective::Medium;
                curi.ordinal = self.next_ordinal();
                wq.reposition(&holder_key, curi)?;
                0
            } else {
                curi.processing_cleanup();
                wq.update(curi)?;
                let retry_secs = curi
                    .retry_delay_override_secs
                    .unwrap_or(settings.retry_delay_secs);
                (retry_secs * 1000).max(politeness)
            };
            tracing::debug!(
                target: "frontier",
                uri = %curi.uri,
                status = curi.fetch_status,
                attempts = curi.fetch_attempts,
                delay_ms,
                "retrying"
            );
            return Ok((disposition, delay_ms));
        }

        wq.dequeue(&holder_key)?;
        metrics.queued.dec();
        match disposition {
            Disposition::Succeeded => {
                metrics.succeeded.inc();
                wq.tallies.succeeded += 1;
                if let Some(journal) = &self.journal {
                    journal.succeeded(&curi.uri);
                }
            }
            Disposition::Failed => {
                metrics.failed.inc();
                wq.tallies.failed += 1;
                wq.note_error(settings.error_penalty_amount);
                if let Some(journal) = &self.journal {
                    journal.failed(&curi.uri);
                }
            }
            Disposition::Disregarded => {
                metrics.disregarded.inc();
                wq.tallies.disregarded += 1;
                if let Some(journal) = &self.journal {
                    journal.failed(&curi.uri);
                }
                if self.config.read().forget_disregarded {
                    self.uniq.forget(&curi.uri);
                }
            }
            Disposition::Retried => {}
        }

        tracing::info!(
            target: "uri_processing",
            uri = %curi.uri,
            status = curi.fetch_status,
            attempts = curi.fetch_attempts,
            size = curi.content_size,
            path = %curi.path_from_seed,
            via = curi.via.as_deref().unwrap_or("-"),
            queue = %wq.class_key(),
            disposition = ?disposition,
            "finished"
        );
        Ok((disposition, politeness))
    }

    /// Put a queue back into rotation after one of its URIs came back.
    fn refile_after_finish(&self, wq: &mut WorkQueue, delay_ms: u64) {
        let now = now_ms();
        if delay_ms > 0 {
            // A queue below its valence stays ready while URIs are out; the
            // wake time is what holds off its next emission.
            wq.set_wake_time_ms(wq.wake_time_ms().max(now + delay_ms));
        }

        // Ready: still rotating with other URIs out. Retired, frozen or
        // inactive: someone else already decided where it lives.
        if wq.state() != QueueState::InProcess {
            return;
        }

        let (hold, snooze_deactivate_ms) = {
            let config = self.config.read();
            (config.hold_queues, config.snooze_deactivate_ms)
        };

        if wq.is_empty() {
            wq.transition(QueueState::Empty);
            wq.clear_held();
            return;
        }
        if wq.is_over_total_budget() {
            self.retire(wq);
            return;
        }

        let mut pools = self.pools.lock();
        if hold && wq.is_over_budget() {
            wq.transition(QueueState::Inactive);
            pools.inactive.push_back(wq.class_key().to_string());
        } else if wq.wake_time_ms() > now {
            rest(wq, &mut pools, now, snooze_deactivate_ms);
        } else {
            wq.transition(QueueState::Ready);
            pools.ready.push_back(wq.class_key().to_string());
        }
    }

    /// Remove every waiting URI matching `pattern` from every queue. URIs out
    /// with workers are left alone. Returns how many were removed.
    pub fn delete_matching(&self, pattern: &str) -> Result<u64, FrontierError> {
        let regex = Regex::new(pattern)?;
        let mut deleted = 0;

        for queue in self.all_queues() {
            let mut wq = queue.lock();
            if wq.is_empty() {
                continue;
            }
            let removed = wq.remove_matching(|c| regex.is_match(&c.uri))?;
            for mut curi in removed {
                curi.fetch_status = status::DELETED_BY_USER;
                self.ctx.metrics.queued.dec();
                self.ctx.metrics.disregarded.inc();
                wq.tallies.disregarded += 1;
                if let Some(journal) = &self.journal {
                    journal.failed(&curi.uri);
                }
                tracing::info!(
                    target: "uri_processing",
                    uri = %curi.uri,
                    status = curi.fetch_status,
                    queue = %wq.class_key(),
                    disposition = ?Disposition::Disregarded,
                    "deleted"
                );
                deleted += 1;
            }
        }

        tracing::info!("Deleted {} queued URIs matching {}", deleted, pattern);
        Ok(deleted)
    }
}
