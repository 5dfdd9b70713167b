use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::queue_store::StoreKey;

/// Fetch status codes. Positive values are protocol response codes; zero and
/// negative values are crawler-internal outcomes.
pub mod status {
    pub const UNATTEMPTED: i32 = 0;
    pub const DOMAIN_UNRESOLVABLE: i32 = -1;
    pub const CONNECT_FAILED: i32 = -2;
    pub const CONNECT_LOST: i32 = -3;
    pub const TIMEOUT: i32 = -4;
    pub const RUNTIME_EXCEPTION: i32 = -5;
    pub const DEFERRED: i32 = -50;
    pub const UNQUEUEABLE: i32 = -60;
    pub const TOO_MANY_EMBED_HOPS: i32 = -4000;
    pub const TOO_MANY_LINK_HOPS: i32 = -4001;
    pub const OUT_OF_SCOPE: i32 = -5000;
    pub const BLOCKED_BY_USER: i32 = -5001;
    pub const BLOCKED_BY_CUSTOM_PROCESSOR: i32 = -5002;
    pub const DELETED_BY_USER: i32 = -6000;
    pub const ROBOTS_PRECLUDED: i32 = -9998;

    pub const HTTP_UNAUTHORIZED: i32 = 401;

    pub fn is_success(code: i32) -> bool {
        (200..400).contains(&code)
    }

    /// Outcomes decided by scope or policy rather than by the remote host.
    pub fn is_disregarded(code: i32) -> bool {
        matches!(
            code,
            ROBOTS_PRECLUDED
                | BLOCKED_BY_CUSTOM_PROCESSOR
                | OUT_OF_SCOPE
                | BLOCKED_BY_USER
                | TOO_MANY_EMBED_HOPS
                | TOO_MANY_LINK_HOPS
                | DELETED_BY_USER
        )
    }

    /// Network-level failures worth another attempt after a delay.
    pub fn is_transient(code: i32) -> bool {
        matches!(code, CONNECT_FAILED | CONNECT_LOST | DOMAIN_UNRESOLVABLE)
    }
}

/// Priority tier inside a work queue. Lower byte values sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingDirective {
    High,
    Medium,
    Normal,
}

impl SchedulingDirective {
    pub fn as_byte(self) -> u8 {
        match self {
            SchedulingDirective::High => 1,
            SchedulingDirective::Medium => 2,
            SchedulingDirective::Normal => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SchedulingDirective::High),
            2 => Some(SchedulingDirective::Medium),
            3 => Some(SchedulingDirective::Normal),
            _ => None,
        }
    }

    /// Priority records sit on the LIFO stack ahead of the FIFO tail.
    pub fn is_priority(self) -> bool {
        self != SchedulingDirective::Normal
    }
}

/// How `finished` disposed of a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Failed,
    Disregarded,
    /// Left at the head of its queue for another attempt.
    Retried,
}

/// A discovered URI plus everything the scheduler tracks about it.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlUri {
    pub uri: String,
    pub is_seed: bool,
    /// One letter per hop from the seed: L link, E embed, R redirect, P prerequisite, X speculative.
    pub path_from_seed: String,
    pub via: Option<String>,
    pub directive: SchedulingDirective,
    /// Key of the queue holding this URI, set when it is first queued.
    pub class_key: Option<String>,
    pub fetch_status: i32,
    pub fetch_attempts: u32,
    pub cost: Option<u32>,
    pub content_size: u64,
    /// Position of this record in the queue store.
    pub holder_key: Option<StoreKey>,
    pub ordinal: u64,
    pub force_fetch: bool,
    pub has_credentials: bool,
    pub retry_delay_override_secs: Option<u64>,

    // Transient: valid for one pass through the fetch pipeline.
    pub fetch_began_ms: Option<u64>,
    pub fetch_completed_ms: Option<u64>,
    pub localized_errors: Vec<String>,
    pub attributes: HashMap<String, String>,
}

impl CrawlUri {
    pub fn new(uri: impl Into<String>, path_from_seed: impl Into<String>, via: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            is_seed: false,
            path_from_seed: path_from_seed.into(),
            via,
            directive: SchedulingDirective::Normal,
            class_key: None,
            fetch_status: status::UNATTEMPTED,
            fetch_attempts: 0,
            cost: None,
            content_size: 0,
            holder_key: None,
            ordinal: 0,
            force_fetch: false,
            has_credentials: false,
            retry_delay_override_secs: None,
            fetch_began_ms: None,
            fetch_completed_ms: None,
            localized_errors: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn seed(uri: impl Into<String>) -> Self {
        let mut curi = Self::new(uri, "", None);
        curi.is_seed = true;
        curi
    }

    pub fn with_directive(mut self, directive: SchedulingDirective) -> Self {
        self.directive = directive;
        self
    }

    pub fn last_hop(&self) -> Option<char> {
        self.path_from_seed.chars().last()
    }

    /// Number of `L` hops anywhere in the path.
    pub fn link_hops(&self) -> u32 {
        self.path_from_seed.chars().filter(|c| *c == 'L').count() as u32
    }

    /// Number of trailing hops since the last navigational link.
    pub fn embed_hops(&self) -> u32 {
        self.path_from_seed
            .chars()
            .rev()
            .take_while(|c| *c != 'L')
            .count() as u32
    }

    pub fn fetch_duration_ms(&self) -> Option<u64> {
        match (self.fetch_began_ms, self.fetch_completed_ms) {
            (Some(began), Some(completed)) => Some(completed.saturating_sub(began)),
            _ => None,
        }
    }

    pub fn set_fetch_times(&mut self, began_ms: u64, completed_ms: u64) {
        self.fetch_began_ms = Some(began_ms);
        self.fetch_completed_ms = Some(completed_ms);
    }

    /// Reset per-attempt state before a retry. Status and attempt count survive.
    pub fn processing_cleanup(&mut self) {
        self.fetch_began_ms = None;
        self.fetch_completed_ms = None;
        self.localized_errors.clear();
        self.attributes.clear();
    }

    /// Drop everything that is only meaningful while the URI is in flight.
    pub fn strip_to_minimal(&mut self) {
        self.processing_cleanup();
        self.holder_key = None;
        self.retry_delay_override_secs = None;
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
