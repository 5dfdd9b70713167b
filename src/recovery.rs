//! Rebuild a frontier from an earlier crawl's recovery journal.
//!
//! Pass 1 reads the whole journal and marks every finished URI as already
//! included, copying those completions into the new frontier's own journal.
//! Pass 2 reads it again on a background thread and schedules every add; the
//! dedup filter drops the ones pass 1 marked.

use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::frontier::Frontier;
use crate::journal::{JournalError, JournalLine, JournalReader};
use crate::models::CrawlUri;

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Lines read by the completion pass.
    pub completion_lines: u64,
    /// URIs marked as already included.
    pub completed: u64,
    /// Lines read by the scheduling pass.
    pub queue_lines: u64,
    /// `F+` lines offered to the frontier.
    pub scheduled: u64,
    /// The journal ended in a damaged or partial record.
    pub truncated: bool,
}

/// Released once enough URIs are queued to start crawling, or when the
/// scheduling pass ends.
#[derive(Default)]
struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn release(&self) {
        let mut released = self.released.lock();
        if !*released {
            *released = true;
            self.cond.notify_all();
        }
    }

    fn is_released(&self) -> bool {
        *self.released.lock()
    }

    fn acquire(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }
}

/// Keeps the frontier from reporting exhaustion while the replay thread is
/// still adding work.
struct FeedGuard(Arc<Frontier>);

impl FeedGuard {
    fn new(frontier: Arc<Frontier>) -> Self {
        frontier.begin_feed();
        Self(frontier)
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.0.end_feed();
    }
}

/// A replay whose scheduling pass may still be running.
pub struct RecoveryHandle {
    enough: Arc<Latch>,
    completion: ReplayStats,
    handle: Option<thread::JoinHandle<Result<ReplayStats, JournalError>>>,
}

impl RecoveryHandle {
    /// Block until enough URIs are queued to start crawling.
    pub fn wait_for_enough(&self) {
        self.enough.acquire();
    }

    pub fn has_enough(&self) -> bool {
        self.enough.is_released()
    }

    /// Wait for the scheduling pass to finish.
    pub fn join(mut self) -> Result<ReplayStats, JournalError> {
        let Some(handle) = self.handle.take() else {
            return Ok(self.completion.clone());
        };
        let queued = handle.join().map_err(|_| JournalError::ReplayPanicked)??;
        Ok(ReplayStats {
            completion_lines: self.completion.completion_lines,
            completed: self.completion.completed,
            truncated: self.completion.truncated || queued.truncated,
            ..queued
        })
    }
}

/// Replay `source` into `frontier`. Returns once the completion pass is done;
/// the scheduling pass continues in the background.
///
/// With `retain_failures`, URIs that finally failed count as done too.
pub fn replay(
    frontier: Arc<Frontier>,
    source: &Path,
    retain_failures: bool,
) -> Result<RecoveryHandle, JournalError> {
    tracing::info!("Recovering completion state from {}", source.display());
    let completion = import_completions(&frontier, source, retain_failures)?;
    tracing::info!(
        "Completion state recovered: {} of {} lines marked done; recovering queues",
        completion.completed,
        completion.completion_lines
    );

    // Fail early on an unreadable journal rather than inside the thread.
    let reader = JournalReader::open(source)?;
    let enough = Arc::new(Latch::default());
    let guard = FeedGuard::new(Arc::clone(&frontier));
    let thread_enough = Arc::clone(&enough);
    let total_lines = completion.completion_lines;
    let path: PathBuf = source.to_path_buf();

    let handle = thread::Builder::new()
        .name("journal-replay".to_string())
        .spawn(move || {
            let result = import_queues(&guard.0, reader, total_lines, &thread_enough);
            guard.0.flush();
            drop(guard);
            thread_enough.release();
            match &result {
                Ok(stats) => tracing::info!(
                    "Finished recovering frontier from {}: {} adds replayed",
                    path.display(),
                    stats.scheduled
                ),
                Err(e) => tracing::error!("Recovery from {} failed: {}", path.display(), e),
            }
            result
        })?;

    Ok(RecoveryHandle {
        enough,
        completion,
        handle: Some(handle),
    })
}

fn import_completions(
    frontier: &Frontier,
    source: &Path,
    retain_failures: bool,
) -> Result<ReplayStats, JournalError> {
    let mut reader = JournalReader::open(source)?;
    let mut stats = ReplayStats::default();

    for line in reader.by_ref() {
        let done = match line {
            JournalLine::Succeeded(uri) => {
                if let Some(journal) = frontier.journal() {
                    journal.succeeded(&uri);
                }
                Some(uri)
            }
            JournalLine::Failed(uri) if retain_failures => {
                if let Some(journal) = frontier.journal() {
                    journal.failed(&uri);
                }
                Some(uri)
            }
            _ => None,
        };
        if let Some(uri) = done {
            frontier.consider_included(&uri);
            stats.completed += 1;
        }
    }

    stats.completion_lines = reader.lines_read();
    stats.truncated = reader.truncated();
    if stats.truncated {
        tracing::warn!(
            "Journal {} ends in a damaged record after {} lines",
            source.display(),
            stats.completion_lines
        );
    }
    Ok(stats)
}

fn import_queues(
    frontier: &Frontier,
    mut reader: JournalReader,
    total_lines: u64,
    enough: &Latch,
) -> Result<ReplayStats, JournalError> {
    let mut stats = ReplayStats::default();
    let mut next_progress = Config::REPLAY_PROGRESS_INTERVAL;

    while let Some(line) = reader.next() {
        if let JournalLine::Added {
            uri,
            path_from_seed,
            via,
        } = line
        {
            let is_seed = path_from_seed.is_empty() && via.is_none();
            let mut curi = CrawlUri::new(uri, path_from_seed, via);
            curi.is_seed = is_seed;
            frontier.schedule(curi);
            stats.scheduled += 1;

            if frontier.queued_uri_count() >= Config::ENOUGH_TO_START_CRAWLING {
                enough.release();
            }
        }

        if reader.lines_read() >= next_progress {
            next_progress += Config::REPLAY_PROGRESS_INTERVAL;
            tracing::info!(
                "Through line {}/{}: queued count = {}",
                reader.lines_read(),
                total_lines,
                frontier.queued_uri_count()
            );
        }
    }

    stats.queue_lines = reader.lines_read();
    stats.truncated = reader.truncated();
    Ok(stats)
}
