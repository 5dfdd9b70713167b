//! Frontier configuration: crawl-wide knobs with per-host overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::cost::CostPolicy;

// Process-wide constants - single source of truth

pub struct Config;

impl Config {
    // Scheduler timing
    pub const DEFAULT_WAIT_MS: u64 = 1000;

    // Recovery journal
    pub const JOURNAL_FILENAME: &'static str = "recover.gz";
    pub const JOURNAL_TIMESTAMP_INTERVAL: u64 = 10_000;
    pub const JOURNAL_CHANNEL_CAPACITY: usize = 100_000;
    pub const JOURNAL_BATCH_TIMEOUT_MS: u64 = 50;
    pub const JOURNAL_MAX_BATCH: usize = 5000;
    pub const ENOUGH_TO_START_CRAWLING: u64 = 50_000;
    pub const REPLAY_PROGRESS_INTERVAL: u64 = 1_000_000;

    // Persistence layout under the data dir
    pub const STATE_DB_FILENAME: &'static str = "frontier.redb";
    pub const CHECKPOINT_DIR: &'static str = "checkpoint";
    pub const CHECKPOINT_FILENAME: &'static str = "frontier.json";
    pub const SPILL_DIR: &'static str = "spill";
    pub const LOG_DIR: &'static str = "logs";

    // Bloom filter sizing
    pub const BLOOM_EXPECTED_ITEMS: usize = 10_000_000;
    pub const BLOOM_FP_RATE: f64 = 0.0001;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which set implementation backs the dedup filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqFilterKind {
    #[default]
    Memory,
    Bloom,
    Persistent,
}

/// Which storage holds pending URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStoreKind {
    #[default]
    Memory,
    Persistent,
}

/// How a URI is mapped to the key of the queue that will hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAssignment {
    /// `host[:port]`
    #[default]
    Hostname,
    /// Resolved address when the host record has a valid one, else the host key.
    Ip,
}

/// Per-host (or per-domain) overrides. Unset fields fall back to the crawl-wide value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOverrides {
    pub delay_factor: Option<f64>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub host_valence: Option<usize>,
    pub max_per_host_bandwidth_kbps: Option<u64>,
    pub queue_total_budget: Option<i64>,
    pub balance_replenish_amount: Option<i64>,
    pub error_penalty_amount: Option<i64>,
    /// Route every URI of the host into this queue key.
    pub force_queue: Option<String>,
}

/// Settings in effect for one host after overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    pub delay_factor: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub host_valence: usize,
    pub max_per_host_bandwidth_kbps: u64,
    pub queue_total_budget: i64,
    pub balance_replenish_amount: i64,
    pub error_penalty_amount: i64,
    pub force_queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontierConfig {
    pub delay_factor: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub host_valence: usize,
    pub max_overall_bandwidth_kbps: u64,
    pub max_per_host_bandwidth_kbps: u64,
    pub hold_queues: bool,
    pub balance_replenish_amount: i64,
    pub error_penalty_amount: i64,
    pub queue_total_budget: i64,
    pub memory_head_capacity: usize,
    pub snooze_deactivate_ms: u64,
    pub preference_embed_hops: u32,
    pub cost_policy: CostPolicy,
    pub uniq_filter: UniqFilterKind,
    pub queue_store: QueueStoreKind,
    pub queue_assignment: QueueAssignment,
    pub uniq_batch_size: usize,
    pub forget_disregarded: bool,
    pub retain_failures: bool,
    pub pause_at_start: bool,
    pub host_cache_capacity: usize,
    pub journal: bool,
    pub overrides: HashMap<String, HostOverrides>,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            delay_factor: 5.0,
            min_delay_ms: 3000,
            max_delay_ms: 30_000,
            max_retries: 30,
            retry_delay_secs: 900,
            host_valence: 1,
            max_overall_bandwidth_kbps: 0,
            max_per_host_bandwidth_kbps: 0,
            hold_queues: true,
            balance_replenish_amount: 3000,
            error_penalty_amount: 1,
            queue_total_budget: -1,
            memory_head_capacity: 3000,
            snooze_deactivate_ms: 5 * 60 * 1000,
            preference_embed_hops: 1,
            cost_policy: CostPolicy::Unit,
            uniq_filter: UniqFilterKind::Memory,
            queue_store: QueueStoreKind::Memory,
            queue_assignment: QueueAssignment::Hostname,
            uniq_batch_size: 1,
            forget_disregarded: false,
            retain_failures: false,
            pause_at_start: false,
            host_cache_capacity: 10_000,
            journal: true,
            overrides: HashMap::new(),
        }
    }
}

impl FrontierConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: FrontierConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_factor < 0.0 || !self.delay_factor.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "delay_factor must be a non-negative number, got {}",
                self.delay_factor
            )));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.host_valence == 0 {
            return Err(ConfigError::Invalid("host_valence must be at least 1".to_string()));
        }
        if self.memory_head_capacity == 0 {
            return Err(ConfigError::Invalid(
                "memory_head_capacity must be at least 1".to_string(),
            ));
        }
        for (host, o) in &self.overrides {
            if o.host_valence == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "override for {} sets host_valence to 0",
                    host
                )));
            }
            let min = o.min_delay_ms.unwrap_or(self.min_delay_ms);
            let max = o.max_delay_ms.unwrap_or(self.max_delay_ms);
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "override for {} has min_delay_ms ({}) above max_delay_ms ({})",
                    host, min, max
                )));
            }
        }
        Ok(())
    }

    /// Find the override that applies to a host key: the exact key, the bare
    /// host without port, then each parent domain.
    pub fn override_for(&self, host_key: &str) -> Option<&HostOverrides> {
        if self.overrides.is_empty() {
            return None;
        }
        if let Some(o) = self.overrides.get(host_key) {
            return Some(o);
        }
        let mut host = strip_port(host_key);
        loop {
            if let Some(o) = self.overrides.get(host) {
                return Some(o);
            }
            match host.find('.') {
                Some(pos) => host = &host[pos + 1..],
                None => return None,
            }
        }
    }

    pub fn settings_for(&self, host_key: &str) -> HostSettings {
        let mut settings = HostSettings {
            delay_factor: self.delay_factor,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            max_retries: self.max_retries,
            retry_delay_secs: self.retry_delay_secs,
            host_valence: self.host_valence,
            max_per_host_bandwidth_kbps: self.max_per_host_bandwidth_kbps,
            queue_total_budget: self.queue_total_budget,
            balance_replenish_amount: self.balance_replenish_amount,
            error_penalty_amount: self.error_penalty_amount,
            force_queue: None,
        };

        if let Some(o) = self.override_for(host_key) {
            if let Some(v) = o.delay_factor {
                settings.delay_factor = v;
            }
            if let Some(v) = o.min_delay_ms {
                settings.min_delay_ms = v;
            }
            if let Some(v) = o.max_delay_ms {
                settings.max_delay_ms = v;
            }
            if let Some(v) = o.max_retries {
                settings.max_retries = v;
            }
            if let Some(v) = o.retry_delay_secs {
                settings.retry_delay_secs = v;
            }
            if let Some(v) = o.host_valence {
                settings.host_valence = v;
            }
            if let Some(v) = o.max_per_host_bandwidth_kbps {
                settings.max_per_host_bandwidth_kbps = v;
            }
            if let Some(v) = o.queue_total_budget {
                settings.queue_total_budget = v;
            }
            if let Some(v) = o.balance_replenish_amount {
                settings.balance_replenish_amount = v;
            }
            if let Some(v) = o.error_penalty_amount {
                settings.error_penalty_amount = v;
            }
            settings.force_queue = o.force_queue.clone();
        }

        settings
    }
}

fn strip_port(host_key: &str) -> &str {
    // IPv6 literals keep their brackets; only a trailing `:digits` is a port.
    match host_key.rfind(':') {
        Some(pos)
            if !host_key[pos + 1..].is_empty()
                && host_key[pos + 1..].bytes().all(|b| b.is_ascii_digit())
                && !host_key[..pos].ends_with(':') =>
        {
            &host_key[..pos]
        }
        _ => host_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = FrontierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.host_valence, 1);
        assert_eq!(config.queue_total_budget, -1);
        assert_eq!(config.max_retries, 30);
    }

    #[test]
    fn test_override_resolution_walks_parent_domains() {
        let mut config = FrontierConfig::default();
        config.overrides.insert(
            "example.com".to_string(),
            HostOverrides {
                min_delay_ms: Some(100),
                ..Default::default()
            },
        );
        config.overrides.insert(
            "slow.example.com".to_string(),
            HostOverrides {
                max_retries: Some(2),
                ..Default::default()
            },
        );

        let www = config.settings_for("www.example.com");
        assert_eq!(www.min_delay_ms, 100);
        assert_eq!(www.max_retries, 30);

        let slow = config.settings_for("slow.example.com:8080");
        assert_eq!(slow.max_retries, 2);
        assert_eq!(slow.min_delay_ms, 3000);

        let other = config.settings_for("other.org");
        assert_eq!(other.min_delay_ms, 3000);
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = FrontierConfig {
            min_delay_ms: 5000,
            max_delay_ms: 100,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frontier.json");
        std::fs::write(
            &path,
            r#"{ "min_delay_ms": 10, "cost_policy": "wag", "overrides": { "a.test": { "host_valence": 2 } } }"#,
        )
        .unwrap();

        let config = FrontierConfig::from_json_file(&path).unwrap();
        assert_eq!(config.min_delay_ms, 10);
        assert_eq!(config.cost_policy, CostPolicy::Wag);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.settings_for("a.test").host_valence, 2);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
    }
}
