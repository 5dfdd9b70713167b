//! Dedup filter: lets each canonical URI into the frontier exactly once.
//!
//! Candidates are buffered in a channel and flushed in batches under one lock.
//! Accepted records are handed to a receiver after the lock is released, so a
//! receiver may itself schedule more work without deadlocking.

use bloomfilter::Bloom;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use redb::{Database, Durability, ReadableTableMetadata, TableDefinition};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::config::{Config, UniqFilterKind};
use crate::models::CrawlUri;
use crate::url_utils::uniq_key;

#[derive(Error, Debug)]
pub enum UniqError {
    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Persistent filter requested without a database")]
    NoDatabase,
}

/// Whoever takes delivery of URIs the filter lets through.
pub trait UriReceiver {
    fn receive(&self, curi: CrawlUri);
}

const ALREADY_SEEN: TableDefinition<u64, u8> = TableDefinition::new("already_seen");

enum SeenSet {
    Memory(HashSet<u64>),
    Bloom(Box<Bloom<u64>>),
    Persistent(Arc<Database>),
}

impl SeenSet {
    /// Insert every key; returns a flag per key, true when it was new.
    fn insert_batch(&mut self, keys: &[u64]) -> Result<Vec<bool>, UniqError> {
        match self {
            SeenSet::Memory(set) => Ok(keys.iter().map(|k| set.insert(*k)).collect()),
            SeenSet::Bloom(bloom) => Ok(keys.iter().map(|k| !bloom.check_and_set(k)).collect()),
            SeenSet::Persistent(db) => {
                let mut write_txn = db.begin_write()?;
                write_txn.set_durability(Durability::Eventual);
                let fresh = {
                    let mut table = write_txn.open_table(ALREADY_SEEN)?;
                    let mut fresh = Vec::with_capacity(keys.len());
                    for key in keys {
                        fresh.push(table.insert(*key, 1u8)?.is_none());
                    }
                    fresh
                };
                write_txn.commit()?;
                Ok(fresh)
            }
        }
    }

    fn contains(&self, key: u64) -> Result<bool, UniqError> {
        match self {
            SeenSet::Memory(set) => Ok(set.contains(&key)),
            SeenSet::Bloom(bloom) => Ok(bloom.check(&key)),
            SeenSet::Persistent(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(ALREADY_SEEN)?;
                Ok(table.get(key)?.is_some())
            }
        }
    }

    fn remove(&mut self, key: u64) -> Result<bool, UniqError> {
        match self {
            SeenSet::Memory(set) => Ok(set.remove(&key)),
            SeenSet::Bloom(_) => {
                tracing::warn!("Bloom dedup filter cannot forget entries; ignoring");
                Ok(false)
            }
            SeenSet::Persistent(db) => {
                let mut write_txn = db.begin_write()?;
                write_txn.set_durability(Durability::Eventual);
                let removed = {
                    let mut table = write_txn.open_table(ALREADY_SEEN)?;
                    let removed = table.remove(key)?.is_some();
                    removed
                };
                write_txn.commit()?;
                Ok(removed)
            }
        }
    }
}

struct Candidate {
    key: u64,
    curi: CrawlUri,
}

pub struct UniqFilter {
    seen: Mutex<SeenSet>,
    tx: Sender<Candidate>,
    rx: Receiver<Candidate>,
    batch_size: usize,
    count: AtomicU64,
    delivering: AtomicU64,
}

impl UniqFilter {
    pub fn new(
        kind: UniqFilterKind,
        db: Option<Arc<Database>>,
        batch_size: usize,
    ) -> Result<Self, UniqError> {
        let mut initial = 0;
        let seen = match kind {
            UniqFilterKind::Memory => SeenSet::Memory(HashSet::new()),
            UniqFilterKind::Bloom => SeenSet::Bloom(Box::new(Bloom::new_for_fp_rate(
                Config::BLOOM_EXPECTED_ITEMS,
                Config::BLOOM_FP_RATE,
            ))),
            UniqFilterKind::Persistent => {
                let db = db.ok_or(UniqError::NoDatabase)?;
                let write_txn = db.begin_write()?;
                {
                    let table = write_txn.open_table(ALREADY_SEEN)?;
                    initial = table.len()?;
                }
                write_txn.commit()?;
                SeenSet::Persistent(db)
            }
        };

        let (tx, rx) = flume::unbounded();
        Ok(Self {
            seen: Mutex::new(seen),
            tx,
            rx,
            batch_size: batch_size.max(1),
            count: AtomicU64::new(initial),
            delivering: AtomicU64::new(0),
        })
    }

    /// In-memory filter delivering every add immediately.
    pub fn in_memory() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            seen: Mutex::new(SeenSet::Memory(HashSet::new())),
            tx,
            rx,
            batch_size: 1,
            count: AtomicU64::new(0),
            delivering: AtomicU64::new(0),
        }
    }

    /// Offer `curi` under `canonical`; it reaches `receiver` only if the form is new.
    pub fn add(&self, canonical: &str, curi: CrawlUri, receiver: &dyn UriReceiver) {
        let candidate = Candidate {
            key: uniq_key(canonical),
            curi,
        };
        if self.tx.send(candidate).is_err() {
            return;
        }
        if self.rx.len() >= self.batch_size {
            self.flush(receiver);
        }
    }

    /// Deliver `curi` whether or not the form was seen, and mark it seen.
    pub fn add_force(&self, canonical: &str, curi: CrawlUri, receiver: &dyn UriReceiver) {
        self.note(canonical);
        receiver.receive(curi);
    }

    /// Mark a form seen without delivering anything.
    pub fn note(&self, canonical: &str) {
        let key = uniq_key(canonical);
        let mut seen = self.seen.lock();
        match seen.insert_batch(&[key]) {
            Ok(fresh) => {
                if fresh.first().copied().unwrap_or(false) {
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => tracing::error!("Failed to note dedup entry: {}", e),
        }
    }

    /// Remove a form so a later add is delivered again. Returns whether it was present.
    pub fn forget(&self, canonical: &str) -> bool {
        let key = uniq_key(canonical);
        let mut seen = self.seen.lock();
        match seen.remove(key) {
            Ok(true) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!("Failed to forget dedup entry: {}", e);
                false
            }
        }
    }

    pub fn contains(&self, canonical: &str) -> bool {
        let seen = self.seen.lock();
        seen.contains(uniq_key(canonical)).unwrap_or_else(|e| {
            tracing::error!("Failed to read dedup entry: {}", e);
            false
        })
    }

    /// Forms seen so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Candidates buffered or accepted but not yet handed to a receiver.
    pub fn pending(&self) -> u64 {
        self.rx.len() as u64 + self.delivering.load(Ordering::Acquire)
    }

    /// Decide every buffered candidate and deliver the new ones.
    /// Returns how many were delivered.
    pub fn flush(&self, receiver: &dyn UriReceiver) -> usize {
        let accepted = {
            let mut seen = self.seen.lock();
            let batch: Vec<Candidate> = self.rx.try_iter().collect();
            if batch.is_empty() {
                return 0;
            }

            let keys: Vec<u64> = batch.iter().map(|c| c.key).collect();
            let fresh = match seen.insert_batch(&keys) {
                Ok(fresh) => fresh,
                Err(e) => {
                    // Prefer a duplicate fetch over losing work.
                    tracing::error!("Dedup batch insert failed, letting {} through: {}", batch.len(), e);
                    vec![true; batch.len()]
                }
            };

            let accepted: Vec<CrawlUri> = batch
                .into_iter()
                .zip(fresh)
                .filter_map(|(c, new)| new.then_some(c.curi))
                .collect();
            self.count.fetch_add(accepted.len() as u64, Ordering::Relaxed);
            self.delivering.fetch_add(accepted.len() as u64, Ordering::AcqRel);
            accepted
        };

        let delivered = accepted.len();
        for curi in accepted {
            receiver.receive(curi);
            self.delivering.fetch_sub(1, Ordering::AcqRel);
        }
        delivered
    }
}
