use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::{Frontier, FrontierError};
use crate::config::{FrontierConfig, UniqFilterKind};
use crate::context::CrawlContext;
use crate::models::now_ms;
use crate::work_queue::{QueueSnapshot, QueueState, WorkQueue};

/// Crawl-wide counters carried across a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTotals {
    pub succeeded: u64,
    pub failed: u64,
    pub disregarded: u64,
    pub emitted: u64,
    pub retried: u64,
    pub total_bytes: u64,
}

/// Everything needed to rebuild the scheduler on top of a persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierCheckpoint {
    pub written_at: DateTime<Utc>,
    pub next_ordinal: u64,
    pub ready: Vec<String>,
    pub inactive: Vec<String>,
    pub retired: Vec<String>,
    /// (wake time ms, queue key)
    pub snoozed: Vec<(u64, String)>,
    /// Queues with URIs out at checkpoint time. Those URIs are still in the
    /// store and are handed out again after a resume.
    pub in_process: Vec<String>,
    pub queues: Vec<QueueSnapshot>,
    pub totals: CheckpointTotals,
}

impl FrontierCheckpoint {
    pub fn load(path: &std::path::Path) -> Result<Self, FrontierError> {
        if !path.exists() {
            return Err(FrontierError::NoCheckpoint(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Frontier {
    /// Write the scheduler's bookkeeping next to the persistent store so a
    /// later run can `resume`. Returns the checkpoint path.
    pub fn checkpoint(&self) -> Result<PathBuf, FrontierError> {
        let Some(pending) = self.store.pending_store() else {
            return Err(FrontierError::CheckpointUnsupported);
        };
        self.uniq.flush(self);

        let (ready, inactive, retired, snoozed) = {
            let pools = self.pools.lock();
            (
                pools.ready.iter().cloned().collect::<Vec<_>>(),
                pools.inactive.iter().cloned().collect::<Vec<_>>(),
                pools.retired.iter().cloned().collect::<Vec<_>>(),
                pools.snoozed.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let mut queues = Vec::new();
        let mut in_process = Vec::new();
        for queue in self.all_queues() {
            let wq = queue.lock();
            if wq.state() == QueueState::InProcess {
                in_process.push(wq.class_key().to_string());
            }
            queues.push(wq.snapshot());
        }
        queues.sort_by(|a, b| a.class_key.cmp(&b.class_key));
        pending.sync()?;

        let metrics = &self.ctx.metrics;
        let checkpoint = FrontierCheckpoint {
            written_at: Utc::now(),
            next_ordinal: self.ordinal.load(Ordering::Relaxed),
            ready,
            inactive,
            retired,
            snoozed,
            in_process,
            queues,
            totals: CheckpointTotals {
                succeeded: metrics.succeeded.get(),
                failed: metrics.failed.get(),
                disregarded: metrics.disregarded.get(),
                emitted: metrics.emitted.get(),
                retried: metrics.retried.get(),
                total_bytes: metrics.total_bytes.get(),
            },
        };

        let path = self.ctx.checkpoint_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(
            "Checkpoint written to {}: {} queues, {} queued",
            path.display(),
            checkpoint.queues.len(),
            self.queued_uri_count()
        );
        Ok(path)
    }

    /// Rebuild a frontier from the persistent store and the checkpoint in
    /// `ctx`'s data dir.
    pub fn resume(config: FrontierConfig, ctx: CrawlContext) -> Result<Self, FrontierError> {
        config.validate()?;
        let store = Self::open_store(&config, &ctx)?;
        if !store.is_persistent() {
            return Err(FrontierError::CheckpointUnsupported);
        }
        let checkpoint = FrontierCheckpoint::load(&ctx.checkpoint_path())?;
        if config.uniq_filter != UniqFilterKind::Persistent {
            tracing::warn!(
                "Resuming with a {:?} dedup filter; URIs seen before the checkpoint may be fetched again",
                config.uniq_filter
            );
        }

        let frontier = Self::assemble(config, ctx, store)?;
        frontier.restore_from(&checkpoint)?;
        Ok(frontier)
    }

    fn restore_from(&self, checkpoint: &FrontierCheckpoint) -> Result<(), FrontierError> {
        let now = now_ms();
        let mut restored: HashMap<&str, WorkQueue> = HashMap::new();
        for snapshot in &checkpoint.queues {
            let wq = WorkQueue::restore(&snapshot.class_key, &self.store, snapshot)?;
            restored.insert(snapshot.class_key.as_str(), wq);
        }

        let mut placed: HashSet<String> = HashSet::new();
        let mut queued = 0u64;
        {
            let mut pools = self.pools.lock();
            let mut place = |key: &str, target: QueueState, wq: &mut WorkQueue| {
                if wq.is_empty() && target != QueueState::Retired {
                    wq.transition(QueueState::Empty);
                    return;
                }
                wq.set_held();
                match target {
                    QueueState::Retired => {
                        wq.transition(QueueState::Retired);
                        pools.retired.insert(key.to_string());
                    }
                    QueueState::Inactive => pools.inactive.push_back(key.to_string()),
                    QueueState::Snoozed if wq.wake_time_ms() > now => {
                        wq.transition(QueueState::Snoozed);
                        pools.snoozed.insert((wq.wake_time_ms(), key.to_string()));
                    }
                    _ => {
                        wq.transition(QueueState::Ready);
                        pools.ready.push_back(key.to_string());
                    }
                }
            };

            let ordered = checkpoint
                .ready
                .iter()
                .chain(&checkpoint.in_process)
                .map(|k| (k.as_str(), QueueState::Ready))
                .chain(checkpoint.snoozed.iter().map(|(_, k)| (k.as_str(), QueueState::Snoozed)))
                .chain(checkpoint.inactive.iter().map(|k| (k.as_str(), QueueState::Inactive)))
                .chain(checkpoint.retired.iter().map(|k| (k.as_str(), QueueState::Retired)));
            for (key, target) in ordered {
                if placed.contains(key) {
                    continue;
                }
                if let Some(wq) = restored.get_mut(key) {
                    place(key, target, wq);
                    placed.insert(key.to_string());
                }
            }

            // Queues in no pool: exhausted, or frozen by an operator.
            for snapshot in &checkpoint.queues {
                if placed.contains(&snapshot.class_key) {
                    continue;
                }
                let Some(wq) = restored.get_mut(snapshot.class_key.as_str()) else {
                    continue;
                };
                if snapshot.state == QueueState::Frozen {
                    wq.transition(QueueState::Empty);
                    wq.transition(QueueState::Frozen);
                    wq.set_held();
                } else if wq.is_empty() {
                    wq.transition(QueueState::Empty);
                } else {
                    place(&snapshot.class_key, QueueState::Inactive, wq);
                }
            }
        }

        for (key, wq) in restored {
            queued += wq.count();
            self.queues.insert(key.to_string(), Arc::new(Mutex::new(wq)));
        }

        let metrics = &self.ctx.metrics;
        metrics.queued.set(queued as i64);
        metrics.succeeded.set(checkpoint.totals.succeeded);
        metrics.failed.set(checkpoint.totals.failed);
        metrics.disregarded.set(checkpoint.totals.disregarded);
        metrics.emitted.set(checkpoint.totals.emitted);
        metrics.retried.set(checkpoint.totals.retried);
        metrics.total_bytes.set(checkpoint.totals.total_bytes);
        self.ordinal.store(checkpoint.next_ordinal, Ordering::Relaxed);
        self.wakeup.notify_all();

        tracing::info!(
            "Resumed from checkpoint written {}: {} queues, {} queued",
            checkpoint.written_at,
            checkpoint.queues.len(),
            queued
        );
        Ok(())
    }
}
