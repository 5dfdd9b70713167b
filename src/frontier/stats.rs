use serde::Serialize;
use std::fmt;

use super::Frontier;
use crate::work_queue::QueueState;

/// Point-in-time counts for reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrontierStats {
    pub total_queues: usize,
    pub in_process_queues: usize,
    pub ready_queues: usize,
    pub snoozed_queues: usize,
    pub inactive_queues: usize,
    pub retired_queues: usize,
    pub exhausted_queues: usize,
    pub frozen_queues: usize,
    pub queued: u64,
    pub discovered: u64,
    pub emitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub disregarded: u64,
    pub retried: u64,
    pub total_bytes: u64,
    /// Serialized record sizes in the persistent store; zero for the memory store.
    pub avg_entry_bytes: u64,
    pub max_entry_bytes: u64,
    pub paused: bool,
    pub terminated: bool,
}

impl FrontierStats {
    pub fn active_queues(&self) -> usize {
        self.in_process_queues + self.ready_queues + self.snoozed_queues
    }
}

impl fmt::Display for FrontierStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queues: {} active ({} in-process; {} ready; {} snoozed); {} inactive; {} retired; {} exhausted",
            self.total_queues,
            self.active_queues(),
            self.in_process_queues,
            self.ready_queues,
            self.snoozed_queues,
            self.inactive_queues,
            self.retired_queues,
            self.exhausted_queues
        )
    }
}

impl Frontier {
    pub fn stats(&self) -> FrontierStats {
        let mut stats = {
            let pools = self.pools.lock();
            FrontierStats {
                ready_queues: pools.ready.len(),
                snoozed_queues: pools.snoozed.len(),
                inactive_queues: pools.inactive.len(),
                retired_queues: pools.retired.len(),
                paused: pools.paused,
                terminated: pools.terminated,
                ..Default::default()
            }
        };

        for queue in self.all_queues() {
            let wq = queue.lock();
            stats.total_queues += 1;
            match wq.state() {
                QueueState::InProcess => stats.in_process_queues += 1,
                QueueState::Empty => stats.exhausted_queues += 1,
                QueueState::Frozen => stats.frozen_queues += 1,
                _ => {}
            }
        }

        let metrics = &self.ctx.metrics;
        stats.queued = self.queued_uri_count();
        stats.discovered = self.discovered_uri_count();
        stats.emitted = metrics.emitted.get();
        stats.succeeded = metrics.succeeded.get();
        stats.failed = metrics.failed.get();
        stats.disregarded = metrics.disregarded.get();
        stats.retried = metrics.retried.get();
        stats.total_bytes = metrics.total_bytes.get();
        if let Some(pending) = self.store.pending_store() {
            let (avg, max) = pending.entry_size_stats();
            stats.avg_entry_bytes = avg;
            stats.max_entry_bytes = max;
        }
        stats
    }

    /// Multi-line report: totals, then one line per queue that still holds work.
    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "{}\nqueued {} / discovered {}; succeeded {}, failed {}, disregarded {}, retried {}; {} bytes\n",
            stats,
            stats.queued,
            stats.discovered,
            stats.succeeded,
            stats.failed,
            stats.disregarded,
            stats.retried,
            stats.total_bytes
        );
        if stats.max_entry_bytes > 0 {
            out.push_str(&format!(
                "store entries: {} bytes average, {} bytes largest\n",
                stats.avg_entry_bytes, stats.max_entry_bytes
            ));
        }
        if stats.frozen_queues > 0 {
            out.push_str(&format!("{} frozen\n", stats.frozen_queues));
        }

        let mut lines: Vec<String> = self
            .all_queues()
            .iter()
            .filter_map(|q| {
                let wq = q.lock();
                (!wq.is_empty() || wq.in_process() > 0).then(|| wq.report_line())
            })
            .collect();
        lines.sort();
        for line in lines {
            out.push_str("  ");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_summary() {
        let stats = FrontierStats {
            total_queues: 10,
            in_process_queues: 1,
            ready_queues: 2,
            snoozed_queues: 3,
            inactive_queues: 2,
            retired_queues: 1,
            exhausted_queues: 1,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "10 queues: 6 active (1 in-process; 2 ready; 3 snoozed); 2 inactive; 1 retired; 1 exhausted"
        );
    }
}
