//! In-memory queue contents with the tail spilled to disk past a capacity.
//!
//! The head is a key-ordered map so priority records and the FIFO tail share
//! one ordering. Records that arrive while the head is full (or while older
//! records are already on disk) are appended to a per-queue spill file as
//! `key(16) ∥ len(u32 LE) ∥ rkyv bytes` and read back in order when the head drains.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::models::CrawlUri;
use crate::queue_store::{StoreError, StoreKey, decode_uri, encode_uri};

#[derive(Debug)]
struct SpillFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    read_offset: u64,
    records: usize,
}

impl SpillFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: None,
            read_offset: 0,
            records: 0,
        }
    }

    fn append(&mut self, key: &StoreKey, curi: &CrawlUri) -> Result<(), StoreError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // No records means anything already on disk is left over from an
            // earlier run and must not be read back.
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }

        let bytes = encode_uri(curi)?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(key.as_bytes())?;
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
        self.records += 1;
        Ok(())
    }

    /// Read up to `limit` records from the current read position.
    fn take(&mut self, limit: usize) -> Result<Vec<(StoreKey, CrawlUri)>, StoreError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.read_offset))?;
        let mut reader = BufReader::new(file);

        let mut items = Vec::new();
        while items.len() < limit && self.records > 0 {
            let mut key_bytes = [0u8; 16];
            reader.read_exact(&mut key_bytes)?;
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut item_bytes = vec![0u8; len];
            reader.read_exact(&mut item_bytes)?;

            let key = StoreKey::from_slice(&key_bytes)
                .ok_or_else(|| StoreError::Serialization("malformed spill key".to_string()))?;
            items.push((key, decode_uri(&item_bytes, key)?));

            self.read_offset += (16 + 4 + len) as u64;
            self.records -= 1;
        }

        if self.records == 0 {
            self.reset()?;
        }
        Ok(items)
    }

    fn drain_all(&mut self) -> Result<Vec<(StoreKey, CrawlUri)>, StoreError> {
        let records = self.records;
        self.take(records)
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.writer = None;
        self.read_offset = 0;
        self.records = 0;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Records of one in-memory work queue.
#[derive(Debug)]
pub struct MemoryQueue {
    head: BTreeMap<StoreKey, CrawlUri>,
    capacity: usize,
    spill: Option<SpillFile>,
}

impl MemoryQueue {
    /// `spill_path` of `None` keeps everything in memory regardless of capacity.
    pub fn new(capacity: usize, spill_path: Option<PathBuf>) -> Self {
        Self {
            head: BTreeMap::new(),
            capacity: capacity.max(1),
            spill: spill_path.map(SpillFile::new),
        }
    }

    fn spilled(&self) -> usize {
        self.spill.as_ref().map(|s| s.records).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.spilled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_memory(&self) -> usize {
        self.head.len()
    }

    pub fn insert(&mut self, key: StoreKey, curi: CrawlUri) -> Result<(), StoreError> {
        let spilled = self.spilled();
        let head_full = self.head.len() >= self.capacity;
        match self.spill.as_mut() {
            // Priority records always stay in memory; they belong at the head.
            Some(spill) if !curi.directive.is_priority() && (spilled > 0 || head_full) => {
                spill.append(&key, &curi)
            }
            _ => {
                self.head.insert(key, curi);
                Ok(())
            }
        }
    }

    /// First record not in `skip`, refilling from disk as needed.
    pub fn first_available(&mut self, skip: &BTreeSet<StoreKey>) -> Result<Option<CrawlUri>, StoreError> {
        loop {
            if let Some((_, curi)) = self.head.iter().find(|(k, _)| !skip.contains(*k)) {
                return Ok(Some(curi.clone()));
            }
            if self.spilled() == 0 {
                return Ok(None);
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<(), StoreError> {
        let room = self.capacity.saturating_sub(self.head.len()).max(1);
        if let Some(spill) = self.spill.as_mut() {
            for (key, curi) in spill.take(room)? {
                self.head.insert(key, curi);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &StoreKey) -> Option<CrawlUri> {
        self.head.remove(key)
    }

    /// Overwrite a record already in memory. Returns false if it is not there.
    pub fn update(&mut self, curi: CrawlUri) -> bool {
        match curi.holder_key {
            Some(key) => match self.head.get_mut(&key) {
                Some(slot) => {
                    *slot = curi;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Remove and return every record matching `pred` that is not in `skip`.
    pub fn remove_matching<F>(
        &mut self,
        skip: &BTreeSet<StoreKey>,
        mut pred: F,
    ) -> Result<Vec<CrawlUri>, StoreError>
    where
        F: FnMut(&CrawlUri) -> bool,
    {
        if let Some(spill) = self.spill.as_mut()
            && spill.records > 0
        {
            for (key, curi) in spill.drain_all()? {
                self.head.insert(key, curi);
            }
        }

        let doomed: Vec<StoreKey> = self
            .head
            .iter()
            .filter(|(k, c)| !skip.contains(*k) && pred(*c))
            .map(|(k, _)| *k)
            .collect();
        let removed = doomed
            .iter()
            .filter_map(|k| self.head.remove(k))
            .collect();

        // Push the tail back out so memory use stays bounded.
        if self.spill.is_some() && self.head.len() > self.capacity {
            let overflow: Vec<StoreKey> = self
                .head
                .iter()
                .filter(|(k, c)| !skip.contains(*k) && !c.directive.is_priority())
                .map(|(k, _)| *k)
                .skip(self.capacity)
                .collect();
            for key in overflow {
                if let Some(curi) = self.head.remove(&key)
                    && let Some(spill) = self.spill.as_mut()
                {
                    spill.append(&key, &curi)?;
                }
            }
        }
        Ok(removed)
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        if let Some(spill) = self.spill.as_mut()
            && let Err(e) = spill.reset()
        {
            tracing::warn!("Failed to remove spill file {}: {}", spill.path.display(), e);
        }
    }
}
