use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    /// Buckets sized for politeness waits, from sub-second to the usual max delay.
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (0, 0),
                (100, 0),
                (1000, 0),
                (3000, 0),
                (10_000, 0),
                (30_000, 0),
                (60_000, 0),
                (u64::MAX, 0),
            ],
            sum_ms: 0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value_ms: u64) {
        self.sum_ms = self.sum_ms.saturating_add(value_ms);
        self.count += 1;

        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum_ms / self.count }
    }

    pub fn buckets(&self) -> &[(u64, u64)] {
        &self.buckets
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

// Atomic counter for lock-free metric updates
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed level that moves both ways, such as the queued URI count.
#[derive(Debug)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self { value: AtomicI64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// EWMA with configurable alpha (0=smooth, 1=responsive).
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, new_value: f64) {
        if self.value == 0.0 {
            self.value = new_value;
        } else {
            self.value = self.alpha * new_value + (1.0 - self.alpha) * self.value;
        }
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// Totals the scheduler keeps for reports and the queued-count invariant.
pub struct FrontierMetrics {
    pub queued: Gauge,
    pub succeeded: Counter,
    pub failed: Counter,
    pub disregarded: Counter,
    pub emitted: Counter,
    pub retried: Counter,
    pub total_bytes: Counter,

    pub politeness_delay: Mutex<Histogram>,
    pub fetch_duration_ewma: Mutex<Ewma>,
}

impl FrontierMetrics {
    pub fn new() -> Self {
        Self {
            queued: Gauge::new(),
            succeeded: Counter::new(),
            failed: Counter::new(),
            disregarded: Counter::new(),
            emitted: Counter::new(),
            retried: Counter::new(),
            total_bytes: Counter::new(),
            politeness_delay: Mutex::new(Histogram::new()),
            fetch_duration_ewma: Mutex::new(Ewma::new(0.2)),
        }
    }

    /// Succeeded, failed and disregarded together.
    pub fn finished(&self) -> u64 {
        self.succeeded.get() + self.failed.get() + self.disregarded.get()
    }

    pub fn record_politeness_delay(&self, delay: Duration) {
        self.politeness_delay.lock().observe(delay.as_millis() as u64);
    }

    pub fn record_fetch_duration(&self, duration_ms: u64) {
        self.fetch_duration_ewma.lock().update(duration_ms as f64);
    }

    pub fn mean_fetch_ms(&self) -> f64 {
        self.fetch_duration_ewma.lock().get()
    }
}

impl Default for FrontierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<FrontierMetrics>;
