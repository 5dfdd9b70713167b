//! Worker threads that drive the frontier: `next`, fetch, `finished`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::frontier::{Frontier, FrontierError};
use crate::models::{CrawlUri, now_ms, status};
use crate::url_utils::host_key;

/// Fetches one URI and records the outcome on it: status, size, timings and
/// any per-processor errors.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, curi: &mut CrawlUri);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub fetched: u64,
    pub robots_precluded: u64,
    pub panics: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    fetched: AtomicU64,
    robots_precluded: AtomicU64,
    panics: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            robots_precluded: self.robots_precluded.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A fixed set of named worker threads. Workers stop when the frontier is
/// exhausted or terminated.
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn spawn(
        frontier: Arc<Frontier>,
        fetcher: Arc<dyn Fetcher>,
        threads: usize,
    ) -> std::io::Result<Self> {
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let frontier = Arc::clone(&frontier);
            let fetcher = Arc::clone(&fetcher);
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("frontier-worker-{}", i))
                .spawn(move || worker_loop(&frontier, fetcher.as_ref(), &counters))?;
            handles.push(handle);
        }
        tracing::info!("Started {} frontier workers", handles.len());
        Ok(Self { handles, counters })
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Wait for every worker to stop.
    pub fn join(self) -> WorkerStats {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("Frontier worker panicked outside a fetch");
            }
        }
        let stats = self.counters.snapshot();
        tracing::info!(
            "Workers stopped: {} fetched, {} robots-precluded, {} panics, {} errors",
            stats.fetched,
            stats.robots_precluded,
            stats.panics,
            stats.errors
        );
        stats
    }
}

fn worker_loop(frontier: &Frontier, fetcher: &dyn Fetcher, counters: &Counters) {
    loop {
        let mut curi = match frontier.next() {
            Ok(Some(curi)) => curi,
            Ok(None) | Err(FrontierError::Ended) => return,
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Frontier next() failed: {}", e);
                thread::sleep(Duration::from_millis(Config::DEFAULT_WAIT_MS));
                continue;
            }
        };

        if is_robots_precluded(frontier, &curi) {
            curi.fetch_status = status::ROBOTS_PRECLUDED;
            counters.robots_precluded.fetch_add(1, Ordering::Relaxed);
        } else {
            fetch_guarded(fetcher, &mut curi, counters);
            counters.fetched.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = frontier.finished(curi) {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Frontier finished() failed: {}", e);
        }
    }
}

/// The host's current robots verdict forbids everything.
fn is_robots_precluded(frontier: &Frontier, curi: &CrawlUri) -> bool {
    let Some(host) = host_key(&curi.uri) else {
        return false;
    };
    let Some(record) = frontier.context().server_cache.get(&host) else {
        return false;
    };
    let record = record.lock();
    let now = now_ms();
    !record.robots_expired(now) && record.robots().is_some_and(|v| v.disallow_all)
}

fn fetch_guarded(fetcher: &dyn Fetcher, curi: &mut CrawlUri, counters: &Counters) {
    let began = now_ms();
    let outcome = catch_unwind(AssertUnwindSafe(|| fetcher.fetch(curi)));
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        counters.panics.fetch_add(1, Ordering::Relaxed);
        tracing::error!(target: "runtime_errors", uri = %curi.uri, error = %message, "fetch panicked");
        curi.fetch_status = status::RUNTIME_EXCEPTION;
        curi.localized_errors.push(message);
    }
    if curi.fetch_began_ms.is_none() || curi.fetch_completed_ms.is_none() {
        curi.set_fetch_times(began, now_ms());
    }
}
