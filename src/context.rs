//! Per-crawl shared state, built once when a crawl starts.

use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, FrontierConfig, QueueStoreKind, UniqFilterKind};
use crate::host::ServerCache;
use crate::metrics::{FrontierMetrics, SharedMetrics};
use crate::queue_store::{StoreError, open_database};

/// Everything the frontier's components share for the lifetime of one crawl.
#[derive(Clone)]
pub struct CrawlContext {
    data_dir: PathBuf,
    pub server_cache: Arc<ServerCache>,
    pub metrics: SharedMetrics,
    db: Option<Arc<Database>>,
}

impl CrawlContext {
    /// Open the crawl's state under `data_dir`. The state database is only
    /// opened when the configuration asks for a persistent component.
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &FrontierConfig) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let needs_db = config.queue_store == QueueStoreKind::Persistent
            || config.uniq_filter == UniqFilterKind::Persistent;
        let db = if needs_db {
            Some(open_database(&data_dir, Config::STATE_DB_FILENAME)?)
        } else {
            None
        };

        Ok(Self {
            data_dir,
            server_cache: Arc::new(ServerCache::new(config.host_cache_capacity)),
            metrics: Arc::new(FrontierMetrics::new()),
            db,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(Config::JOURNAL_FILENAME)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir
            .join(Config::CHECKPOINT_DIR)
            .join(Config::CHECKPOINT_FILENAME)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.data_dir.join(Config::SPILL_DIR)
    }
}
