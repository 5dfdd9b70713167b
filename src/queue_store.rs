use redb::{Database, Durability, ReadableTableMetadata, TableDefinition};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::models::{CrawlUri, SchedulingDirective};
use crate::url_utils::fingerprint64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Record without a store key: {0}")]
    MissingKey(String),
}

// ============================================================================
// STORE KEYS
// ============================================================================

/// 16-byte sort key: class fingerprint (8) ∥ directive (1) ∥ cost (1) ∥ ordinal (6).
///
/// All records of one queue share the first 8 bytes and sort by directive,
/// then cost, then ordinal. Priority directives store the ordinal inverted so
/// the newest priority record comes first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey([u8; 16]);

impl StoreKey {
    const ORDINAL_MASK: u64 = 0xFFFF_FFFF_FFFF;

    pub fn new(class_fp: u64, directive: SchedulingDirective, cost: u32, ordinal: u64) -> Self {
        let ordinal = ordinal & Self::ORDINAL_MASK;
        let ordinal = if directive.is_priority() {
            Self::ORDINAL_MASK - ordinal
        } else {
            ordinal
        };
        let low = ((directive.as_byte() as u64) << 56) | ((cost.min(255) as u64) << 48) | ordinal;

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&class_fp.to_be_bytes());
        bytes[8..].copy_from_slice(&low.to_be_bytes());
        Self(bytes)
    }

    /// Smallest key of a class: every record of the class sorts at or after it.
    pub fn class_start(class_fp: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&class_fp.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn class_fingerprint(&self) -> u64 {
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(fp)
    }

    pub fn directive(&self) -> Option<SchedulingDirective> {
        SchedulingDirective::from_byte(self.0[8])
    }

    pub fn cost(&self) -> u8 {
        self.0[9]
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreKey(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

pub fn class_fingerprint(class_key: &str) -> u64 {
    fingerprint64(class_key)
}

// ============================================================================
// STORED RECORDS
// ============================================================================

/// The durable part of a `CrawlUri`; transient pipeline state is never written.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct StoredUri {
    pub uri: String,
    pub is_seed: bool,
    pub path_from_seed: String,
    pub via: Option<String>,
    pub directive: u8,
    pub class_key: Option<String>,
    pub fetch_status: i32,
    pub fetch_attempts: u32,
    pub cost: Option<u32>,
    pub content_size: u64,
    pub ordinal: u64,
    pub force_fetch: bool,
    pub has_credentials: bool,
    pub retry_delay_override_secs: Option<u64>,
}

impl StoredUri {
    pub fn from_curi(curi: &CrawlUri) -> Self {
        Self {
            uri: curi.uri.clone(),
            is_seed: curi.is_seed,
            path_from_seed: curi.path_from_seed.clone(),
            via: curi.via.clone(),
            directive: curi.directive.as_byte(),
            class_key: curi.class_key.clone(),
            fetch_status: curi.fetch_status,
            fetch_attempts: curi.fetch_attempts,
            cost: curi.cost,
            content_size: curi.content_size,
            ordinal: curi.ordinal,
            force_fetch: curi.force_fetch,
            has_credentials: curi.has_credentials,
            retry_delay_override_secs: curi.retry_delay_override_secs,
        }
    }

    pub fn into_curi(self, key: StoreKey) -> CrawlUri {
        let mut curi = CrawlUri::new(self.uri, self.path_from_seed, self.via);
        curi.is_seed = self.is_seed;
        curi.directive =
            SchedulingDirective::from_byte(self.directive).unwrap_or(SchedulingDirective::Normal);
        curi.class_key = self.class_key;
        curi.fetch_status = self.fetch_status;
        curi.fetch_attempts = self.fetch_attempts;
        curi.cost = self.cost;
        curi.content_size = self.content_size;
        curi.ordinal = self.ordinal;
        curi.force_fetch = self.force_fetch;
        curi.has_credentials = self.has_credentials;
        curi.retry_delay_override_secs = self.retry_delay_override_secs;
        curi.holder_key = Some(key);
        curi
    }
}

pub fn encode_uri(curi: &CrawlUri) -> Result<AlignedVec, StoreError> {
    rkyv::to_bytes::<_, 1024>(&StoredUri::from_curi(curi))
        .map_err(|e| StoreError::Serialization(format!("Serialize failed: {}", e)))
}

pub fn decode_uri(bytes: &[u8], key: StoreKey) -> Result<CrawlUri, StoreError> {
    // Copy into an aligned buffer; redb values carry no alignment guarantee.
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let stored: StoredUri = rkyv::from_bytes(&aligned)
        .map_err(|e| StoreError::Serialization(format!("Deserialize failed: {:?}", e)))?;
    Ok(stored.into_curi(key))
}

// ============================================================================
// DATABASE
// ============================================================================

/// Open (or create) the crawl's state database under `data_dir`.
pub fn open_database(data_dir: &std::path::Path, filename: &str) -> Result<Arc<Database>, StoreError> {
    std::fs::create_dir_all(data_dir)?;
    let db = Database::create(data_dir.join(filename))?;
    Ok(Arc::new(db))
}

const PENDING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pending_uris");

/// Every pending URI of every persistent queue, in one key-ordered table.
pub struct PendingUriStore {
    db: Arc<Database>,
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    largest_entry: AtomicU64,
}

impl PendingUriStore {
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        // Open the table once so later read transactions find it.
        let write_txn = db.begin_write()?;
        {
            let _pending = write_txn.open_table(PENDING)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            entries_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            largest_entry: AtomicU64::new(0),
        })
    }

    fn begin_write(&self) -> Result<redb::WriteTransaction, StoreError> {
        let mut txn = self.db.begin_write()?;
        // The recovery journal covers the window between eventual commits.
        txn.set_durability(Durability::Eventual);
        Ok(txn)
    }

    /// Write a record under its holder key.
    pub fn put(&self, curi: &CrawlUri) -> Result<(), StoreError> {
        let key = curi
            .holder_key
            .ok_or_else(|| StoreError::MissingKey(curi.uri.clone()))?;
        let bytes = encode_uri(curi)?;

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING)?;
            table.insert(key.as_bytes().as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        self.tally(bytes.len() as u64);
        Ok(())
    }

    /// Nearest record at or after `key`.
    pub fn get(&self, key: &StoreKey) -> Result<Option<CrawlUri>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;
        let mut range = table.range::<&[u8]>(key.as_bytes().as_slice()..)?;
        match range.next() {
            Some(entry) => {
                let (k, v) = entry?;
                let found = StoreKey::from_slice(k.value())
                    .ok_or_else(|| StoreError::Serialization("malformed store key".to_string()))?;
                Ok(Some(decode_uri(v.value(), found)?))
            }
            None => Ok(None),
        }
    }

    /// First record of a class whose key is not in `skip`.
    pub fn first_in_class(
        &self,
        class_fp: u64,
        skip: &BTreeSet<StoreKey>,
    ) -> Result<Option<CrawlUri>, StoreError> {
        let start = StoreKey::class_start(class_fp);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;

        for entry in table.range::<&[u8]>(start.as_bytes().as_slice()..)? {
            let (k, v) = entry?;
            let key = StoreKey::from_slice(k.value())
                .ok_or_else(|| StoreError::Serialization("malformed store key".to_string()))?;
            if key.class_fingerprint() != class_fp {
                break;
            }
            if skip.contains(&key) {
                continue;
            }
            return Ok(Some(decode_uri(v.value(), key)?));
        }
        Ok(None)
    }

    /// All records of a class, in queue order.
    pub fn scan_class(&self, class_fp: u64) -> Result<Vec<CrawlUri>, StoreError> {
        let start = StoreKey::class_start(class_fp);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;

        let mut records = Vec::new();
        for entry in table.range::<&[u8]>(start.as_bytes().as_slice()..)? {
            let (k, v) = entry?;
            let key = StoreKey::from_slice(k.value())
                .ok_or_else(|| StoreError::Serialization("malformed store key".to_string()))?;
            if key.class_fingerprint() != class_fp {
                break;
            }
            records.push(decode_uri(v.value(), key)?);
        }
        Ok(records)
    }

    pub fn count_class(&self, class_fp: u64) -> Result<u64, StoreError> {
        let start = StoreKey::class_start(class_fp);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;

        let mut count = 0;
        for entry in table.range::<&[u8]>(start.as_bytes().as_slice()..)? {
            let (k, _) = entry?;
            match StoreKey::from_slice(k.value()) {
                Some(key) if key.class_fingerprint() == class_fp => count += 1,
                _ => break,
            }
        }
        Ok(count)
    }

    /// Remove a record. Returns false (and logs) when the key was absent.
    pub fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PENDING)?;
            let removed = table.remove(key.as_bytes().as_slice())?.is_some();
            removed
        };
        write_txn.commit()?;

        if !removed {
            tracing::error!(target: "frontier", ?key, "delete of a record not in the pending store");
        }
        Ok(removed)
    }

    /// Replace the record at `old` with `curi` under its (new) holder key, atomically.
    pub fn replace(&self, old: &StoreKey, curi: &CrawlUri) -> Result<(), StoreError> {
        let key = curi
            .holder_key
            .ok_or_else(|| StoreError::MissingKey(curi.uri.clone()))?;
        let bytes = encode_uri(curi)?;

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING)?;
            table.remove(old.as_bytes().as_slice())?;
            table.insert(key.as_bytes().as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        self.tally(bytes.len() as u64);
        Ok(())
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Force everything committed so far onto disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(Durability::Immediate);
        {
            let _pending = write_txn.open_table(PENDING)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn tally(&self, bytes: u64) {
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.largest_entry.fetch_max(bytes, Ordering::Relaxed);
    }

    /// (average, largest) serialized entry size written so far.
    pub fn entry_size_stats(&self) -> (u64, u64) {
        let entries = self.entries_written.load(Ordering::Relaxed);
        let bytes = self.bytes_written.load(Ordering::Relaxed);
        let avg = if entries == 0 { 0 } else { bytes / entries };
        (avg, self.largest_entry.load(Ordering::Relaxed))
    }
}

// ============================================================================
// STORE SELECTION
// ============================================================================

/// Where work queues keep their records.
#[derive(Clone)]
pub enum QueueStore {
    /// Each queue holds records in memory, spilling its tail to `spill_dir` past `head_capacity`.
    Memory {
        head_capacity: usize,
        spill_dir: Option<PathBuf>,
    },
    /// All queues share one durable table.
    Persistent(Arc<PendingUriStore>),
}

impl QueueStore {
    pub fn is_persistent(&self) -> bool {
        matches!(self, QueueStore::Persistent(_))
    }

    pub fn pending_store(&self) -> Option<&Arc<PendingUriStore>> {
        match self {
            QueueStore::Persistent(store) => Some(store),
            QueueStore::Memory { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, PendingUriStore) {
        let dir = TempDir::new().unwrap();
        let db = open_database(dir.path(), "test.redb").unwrap();
        (dir, PendingUriStore::new(db).unwrap())
    }

    fn keyed(uri: &str, class: &str, directive: SchedulingDirective, ordinal: u64) -> CrawlUri {
        let mut curi = CrawlUri::new(uri, "L", None).with_directive(directive);
        curi.class_key = Some(class.to_string());
        curi.ordinal = ordinal;
        curi.holder_key = Some(StoreKey::new(class_fingerprint(class), directive, 1, ordinal));
        curi
    }

    #[test]
    fn test_key_orders_priority_before_normal() {
        let fp = class_fingerprint("a.test");
        let normal_1 = StoreKey::new(fp, SchedulingDirective::Normal, 1, 1);
        let normal_2 = StoreKey::new(fp, SchedulingDirective::Normal, 1, 2);
        let high = StoreKey::new(fp, SchedulingDirective::High, 1, 3);
        let medium = StoreKey::new(fp, SchedulingDirective::Medium, 1, 0);

        assert!(high < medium);
        assert!(medium < normal_1);
        assert!(normal_1 < normal_2);
        assert!(StoreKey::class_start(fp) < high);
        assert_eq!(high.class_fingerprint(), fp);
        assert_eq!(high.directive(), Some(SchedulingDirective::High));
    }

    #[test]
    fn test_priority_keys_are_lifo() {
        let fp = class_fingerprint("a.test");
        let older = StoreKey::new(fp, SchedulingDirective::High, 1, 10);
        let newer = StoreKey::new(fp, SchedulingDirective::High, 1, 11);
        assert!(newer < older);
    }

    #[test]
    fn test_encode_decode_keeps_durable_fields() {
        let mut curi = keyed("http://a.test/x", "a.test", SchedulingDirective::Medium, 7);
        curi.fetch_attempts = 2;
        curi.via = Some("http://a.test/".to_string());
        curi.localized_errors.push("transient".to_string());
        let key = curi.holder_key.unwrap();

        let bytes = encode_uri(&curi).unwrap();
        let back = decode_uri(&bytes, key).unwrap();
        assert_eq!(back.uri, curi.uri);
        assert_eq!(back.fetch_attempts, 2);
        assert_eq!(back.directive, SchedulingDirective::Medium);
        assert_eq!(back.via, curi.via);
        assert!(back.localized_errors.is_empty());
        assert_eq!(back.holder_key, Some(key));
    }

    #[test]
    fn test_get_returns_nearest_at_or_after() {
        let (_dir, store) = store();
        let a1 = keyed("http://a.test/1", "a.test", SchedulingDirective::Normal, 1);
        let a2 = keyed("http://a.test/2", "a.test", SchedulingDirective::Normal, 2);
        store.put(&a1).unwrap();
        store.put(&a2).unwrap();

        let start = StoreKey::class_start(class_fingerprint("a.test"));
        let first = store.get(&start).unwrap().unwrap();
        assert_eq!(first.uri, "http://a.test/1");
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_first_in_class_skips_checked_out_and_stops_at_class_end() {
        let (_dir, store) = store();
        let a1 = keyed("http://a.test/1", "a.test", SchedulingDirective::Normal, 1);
        let b1 = keyed("http://b.test/1", "b.test", SchedulingDirective::Normal, 2);
        store.put(&a1).unwrap();
        store.put(&b1).unwrap();

        let fp = class_fingerprint("a.test");
        let mut skip = BTreeSet::new();
        assert_eq!(
            store.first_in_class(fp, &skip).unwrap().map(|c| c.uri),
            Some("http://a.test/1".to_string())
        );

        skip.insert(a1.holder_key.unwrap());
        assert!(store.first_in_class(fp, &skip).unwrap().is_none());
        assert_eq!(store.count_class(fp).unwrap(), 1);
    }

    #[test]
    fn test_delete_and_replace() {
        let (_dir, store) = store();
        let a1 = keyed("http://a.test/1", "a.test", SchedulingDirective::Normal, 1);
        store.put(&a1).unwrap();

        let old = a1.holder_key.unwrap();
        let promoted = keyed("http://a.test/1", "a.test", SchedulingDirective::Medium, 5);
        store.replace(&old, &promoted).unwrap();
        assert_eq!(store.len().unwrap(), 1);

        assert!(!store.delete(&old).unwrap());
        assert!(store.delete(&promoted.holder_key.unwrap()).unwrap());
        assert!(store.is_empty().unwrap());

        let (avg, largest) = store.entry_size_stats();
        assert!(avg > 0);
        assert!(largest >= avg);
    }
}
