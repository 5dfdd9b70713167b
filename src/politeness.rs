//! Politeness waits between fetches to one host, and the crawl-wide bandwidth throttle.

use parking_lot::Mutex;
use std::time::Duration;

use crate::config::HostSettings;
use crate::host::HostRecord;
use crate::models::{CrawlUri, now_ms};

/// Milliseconds `bytes` take at a cap of `kbps` KB/s.
fn transfer_ms(bytes: u64, kbps: u64) -> u64 {
    (bytes as u128 * 1000 / (kbps as u128 * 1024)) as u64
}

/// How long a queue must rest after finishing `curi`.
///
/// The wait is the last fetch's duration scaled by the delay factor and clamped
/// to the configured range. With a per-host bandwidth cap the wait also covers
/// the time the host's bytes "cost", and the host record's earliest next emit
/// time is pushed forward accordingly. URIs without fetch timings wait nothing.
pub fn politeness_delay_ms(
    curi: &CrawlUri,
    settings: &HostSettings,
    host: Option<&mut HostRecord>,
    now: u64,
) -> u64 {
    let Some(duration_taken) = curi.fetch_duration_ms() else {
        return 0;
    };

    let scaled = (settings.delay_factor * duration_taken as f64) as u64;
    let mut wait = scaled.max(settings.min_delay_ms).min(settings.max_delay_ms);

    if settings.max_per_host_bandwidth_kbps > 0
        && let Some(host) = host
    {
        let host_wait = host.earliest_next_emit_ms.saturating_sub(now);
        host.earliest_next_emit_ms =
            now + transfer_ms(curi.content_size, settings.max_per_host_bandwidth_kbps);
        wait = wait.max(host_wait);
    }

    wait
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_max_kbps: u64,
    bytes_at_last_emit: u64,
    next_emit_ms: u64,
}

/// Crawl-wide bandwidth cap. Every `next` passes through here, so while a cap
/// is set workers queue up behind one shared sleep.
#[derive(Debug, Default)]
pub struct BandwidthThrottle {
    state: Mutex<ThrottleState>,
}

impl BandwidthThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep as long as needed to keep aggregate throughput under `max_kbps`,
    /// given `total_bytes` processed so far. Returns the time slept.
    pub fn enforce(&self, max_kbps: u64, total_bytes: u64) -> Duration {
        if max_kbps == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        if max_kbps != state.last_max_kbps {
            // A new cap applies from now on, not retroactively.
            state.last_max_kbps = max_kbps;
            state.bytes_at_last_emit = total_bytes;
        }

        let now = now_ms();
        let sleep = Duration::from_millis(state.next_emit_ms.saturating_sub(now));
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }

        let now = now_ms();
        state.next_emit_ms = Self::next_emit_ms(
            max_kbps,
            total_bytes.saturating_sub(state.bytes_at_last_emit),
            state.next_emit_ms,
            now,
        );
        state.bytes_at_last_emit = total_bytes;
        sleep
    }

    /// When the next emit may happen after `bytes` more were transferred.
    /// Any lag behind the previous target is carried over so bursts even out.
    fn next_emit_ms(max_kbps: u64, bytes: u64, previous_target: u64, now: u64) -> u64 {
        let carried = if previous_target == 0 {
            0
        } else {
            previous_target as i64 - now as i64
        };
        let due = transfer_ms(bytes, max_kbps) as i64 + now as i64 + carried;
        due.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrontierConfig;

    fn settings(factor: f64, min: u64, max: u64) -> HostSettings {
        let config = FrontierConfig {
            delay_factor: factor,
            min_delay_ms: min,
            max_delay_ms: max,
            ..Default::default()
        };
        config.settings_for("a.test")
    }

    fn fetched(duration_ms: u64) -> CrawlUri {
        let mut curi = CrawlUri::new("http://a.test/", "L", None);
        curi.set_fetch_times(1_000, 1_000 + duration_ms);
        curi
    }

    #[test]
    fn test_scaled_delay_within_bounds() {
        let s = settings(5.0, 2000, 30_000);
        assert_eq!(politeness_delay_ms(&fetched(2000), &s, None, 0), 10_000);
    }

    #[test]
    fn test_delay_clamped_to_min_and_max() {
        let s = settings(5.0, 2000, 30_000);
        assert_eq!(politeness_delay_ms(&fetched(10), &s, None, 0), 2000);
        assert_eq!(politeness_delay_ms(&fetched(60_000), &s, None, 0), 30_000);
    }

    #[test]
    fn test_no_timings_means_no_wait() {
        let s = settings(5.0, 2000, 30_000);
        let curi = CrawlUri::new("http://a.test/", "L", None);
        assert_eq!(politeness_delay_ms(&curi, &s, None, 0), 0);
    }

    #[test]
    fn test_per_host_bandwidth_extends_wait() {
        let mut s = settings(1.0, 0, 30_000);
        s.max_per_host_bandwidth_kbps = 1;
        let mut host = HostRecord::new("a.test");
        host.earliest_next_emit_ms = 50_000;

        let mut curi = fetched(10);
        curi.content_size = 1024;
        let wait = politeness_delay_ms(&curi, &s, Some(&mut host), 40_000);
        assert_eq!(wait, 10_000);
        assert_eq!(host.earliest_next_emit_ms, 41_000);
    }

    #[test]
    fn test_throttle_disabled_never_sleeps() {
        let throttle = BandwidthThrottle::new();
        assert_eq!(throttle.enforce(0, 1 << 30), Duration::ZERO);
    }

    #[test]
    fn test_next_emit_scales_with_bytes() {
        // 10240 bytes at 10 KB/s take one second.
        assert_eq!(BandwidthThrottle::next_emit_ms(10, 10_240, 0, 5_000), 6_000);
        // Lag behind the previous target is carried over.
        assert_eq!(BandwidthThrottle::next_emit_ms(10, 10_240, 5_500, 5_000), 6_500);
    }

    #[test]
    fn test_first_enforce_after_cap_change_is_free() {
        let throttle = BandwidthThrottle::new();
        assert_eq!(throttle.enforce(1000, 5_000_000), Duration::ZERO);
    }
}
