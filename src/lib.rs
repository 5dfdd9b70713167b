//! Crawl frontier: decides which discovered URI is fetched next and when,
//! keeping per-host politeness, budgets and dedup, with durable queues and a
//! recovery journal.

pub mod config;
pub mod context;
pub mod cost;
pub mod frontier;
pub mod host;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod politeness;
pub mod queue_store;
pub mod recovery;
pub mod seeder;
pub mod spill_queue;
pub mod uniq;
pub mod url_utils;
pub mod work_queue;
pub mod worker;

pub use config::{Config, FrontierConfig};
pub use context::CrawlContext;
pub use frontier::{Frontier, FrontierCheckpoint, FrontierError, FrontierStats};
pub use models::{CrawlUri, Disposition, SchedulingDirective};
pub use recovery::{RecoveryHandle, ReplayStats, replay};
pub use seeder::{FileSeedSource, SeedSource, StaticSeedSource};
pub use worker::{Fetcher, WorkerPool, WorkerStats};
