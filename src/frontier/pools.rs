use std::collections::{BTreeSet, VecDeque};

/// Rotation pools. A queue key sits in at most one pool at a time; a queue
/// that is out with workers or has nothing queued sits in none.
#[derive(Debug, Default)]
pub(crate) struct Pools {
    pub ready: VecDeque<String>,
    pub inactive: VecDeque<String>,
    pub retired: BTreeSet<String>,
    /// (wake time ms, queue key)
    pub snoozed: BTreeSet<(u64, String)>,
    pub paused: bool,
    pub terminated: bool,
}

impl Pools {
    /// Remove and return every snoozed key whose wake time has passed.
    pub fn take_woken(&mut self, now_ms: u64) -> Vec<String> {
        let mut woken = Vec::new();
        while let Some((wake, _)) = self.snoozed.first() {
            if *wake > now_ms {
                break;
            }
            if let Some((_, key)) = self.snoozed.pop_first() {
                woken.push(key);
            }
        }
        woken
    }

    pub fn next_wake_ms(&self) -> Option<u64> {
        self.snoozed.first().map(|(wake, _)| *wake)
    }

    pub fn remove_ready(&mut self, key: &str) {
        self.ready.retain(|k| k != key);
    }
}
