//! Per-host cached state shared by every queue that fetches from the host.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;

/// A resolved address and the moment it stops being trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub ip: IpAddr,
    pub expires_at_ms: u64,
}

/// The robots verdict for a host as reported by the robots processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobotsVerdict {
    pub disallow_all: bool,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HostRecord {
    host_key: String,
    address: Option<ResolvedAddress>,
    robots: Option<RobotsVerdict>,
    /// Earliest wall-clock millisecond at which the per-host bandwidth cap allows the next fetch.
    pub earliest_next_emit_ms: u64,
}

impl HostRecord {
    pub fn new(host_key: impl Into<String>) -> Self {
        Self {
            host_key: host_key.into(),
            address: None,
            robots: None,
            earliest_next_emit_ms: 0,
        }
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn note_resolved(&mut self, ip: IpAddr, ttl_ms: u64, now_ms: u64) {
        self.address = Some(ResolvedAddress {
            ip,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        });
    }

    /// The cached address, if it has not expired.
    pub fn address(&self, now_ms: u64) -> Option<IpAddr> {
        self.address
            .filter(|a| a.expires_at_ms > now_ms)
            .map(|a| a.ip)
    }

    pub fn is_address_valid(&self, now_ms: u64) -> bool {
        self.address(now_ms).is_some()
    }

    pub fn note_robots(&mut self, disallow_all: bool, ttl_ms: u64, now_ms: u64) {
        self.robots = Some(RobotsVerdict {
            disallow_all,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        });
    }

    /// True when there is no verdict or the verdict has expired; callers
    /// defer URIs of such hosts behind a robots prerequisite.
    pub fn robots_expired(&self, now_ms: u64) -> bool {
        match self.robots {
            Some(v) => v.expires_at_ms <= now_ms,
            None => true,
        }
    }

    pub fn robots(&self) -> Option<RobotsVerdict> {
        self.robots
    }
}

pub type SharedHost = Arc<Mutex<HostRecord>>;

/// Host records keyed by host key. Records that nobody else holds are
/// dropped once the cache grows past its capacity; they are rebuilt on demand.
pub struct ServerCache {
    hosts: DashMap<String, SharedHost>,
    capacity: usize,
}

impl ServerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            hosts: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up or create the record for a host.
    pub fn host_for(&self, host_key: &str) -> SharedHost {
        let host = self
            .hosts
            .entry(host_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostRecord::new(host_key))))
            .value()
            .clone();

        if self.hosts.len() > self.capacity {
            self.reclaim();
        }
        host
    }

    pub fn get(&self, host_key: &str) -> Option<SharedHost> {
        self.hosts.get(host_key).map(|h| h.value().clone())
    }

    /// Resolved address for a host key, if cached and unexpired.
    pub fn address_for(&self, host_key: &str, now_ms: u64) -> Option<IpAddr> {
        self.get(host_key).and_then(|h| h.lock().address(now_ms))
    }

    /// Drop unreferenced records until the cache is back under capacity.
    /// Returns how many were dropped.
    pub fn reclaim(&self) -> usize {
        let excess = self.hosts.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }

        let idle: Vec<String> = self
            .hosts
            .iter()
            .filter(|e| Arc::strong_count(e.value()) == 1)
            .map(|e| e.key().clone())
            .take(excess)
            .collect();

        let mut dropped = 0;
        for key in idle {
            if self
                .hosts
                .remove_if(&key, |_, h| Arc::strong_count(h) == 1)
                .is_some()
            {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(target: "frontier", dropped, "reclaimed idle host records");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
