//! Recovery journal: a gzip'd, line-per-event log of scheduling transitions.
//!
//! ```text
//! F+ <uri> <path-from-seed> <via>    added
//! Fe <uri>                           emitted
//! Fr <uri>                           rescheduled
//! Fs <uri>                           succeeded
//! Ff <uri>                           failed
//! T <timestamp>                      every 10000 lines
//! E <timestamp> <message>            error note
//! ```
//!
//! An empty path or via is written as `-`. Lines are produced on the caller's
//! thread and written by a dedicated writer thread, which flushes the gzip
//! stream after every batch.

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;
use crate::models::CrawlUri;

pub const F_ADD: &str = "F+";
pub const F_EMIT: &str = "Fe";
pub const F_RESCHEDULE: &str = "Fr";
pub const F_SUCCESS: &str = "Fs";
pub const F_FAILURE: &str = "Ff";
pub const LOG_TIMESTAMP: &str = "T";
pub const LOG_ERROR: &str = "E";

const EMPTY_FIELD: &str = "-";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal writer thread panicked")]
    WriterPanicked,

    #[error("Journal replay thread panicked")]
    ReplayPanicked,
}

/// One scheduling transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    Added {
        uri: String,
        path_from_seed: String,
        via: Option<String>,
    },
    Emitted(String),
    Rescheduled(String),
    Succeeded(String),
    Failed(String),
    Error(String),
}

impl JournalEvent {
    fn to_line(&self) -> String {
        match self {
            JournalEvent::Added {
                uri,
                path_from_seed,
                via,
            } => {
                let path = if path_from_seed.is_empty() {
                    EMPTY_FIELD
                } else {
                    path_from_seed.as_str()
                };
                let via = via.as_deref().filter(|v| !v.is_empty()).unwrap_or(EMPTY_FIELD);
                format!("{} {} {} {}", F_ADD, uri, path, via)
            }
            JournalEvent::Emitted(uri) => format!("{} {}", F_EMIT, uri),
            JournalEvent::Rescheduled(uri) => format!("{} {}", F_RESCHEDULE, uri),
            JournalEvent::Succeeded(uri) => format!("{} {}", F_SUCCESS, uri),
            JournalEvent::Failed(uri) => format!("{} {}", F_FAILURE, uri),
            JournalEvent::Error(message) => {
                // Keep the journal one event per line.
                let message = message.replace(['\n', '\r'], " ");
                format!("{} {} {}", LOG_ERROR, timestamp(), message)
            }
        }
    }
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

/// Handle to a journal file being written.
pub struct RecoveryJournal {
    path: PathBuf,
    tx: RwLock<Option<Sender<JournalEvent>>>,
    handle: Mutex<Option<thread::JoinHandle<Result<(), JournalError>>>>,
    lines: Arc<AtomicU64>,
}

impl RecoveryJournal {
    /// Open `path` for appending and start the writer thread. Appending to an
    /// existing journal adds a new gzip member; readers see one stream.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        let (tx, rx) = flume::bounded::<JournalEvent>(Config::JOURNAL_CHANNEL_CAPACITY);
        let lines = Arc::new(AtomicU64::new(0));
        let thread_lines = Arc::clone(&lines);
        let handle = thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || Self::writer_loop(encoder, rx, thread_lines))?;

        tracing::info!("Recovery journal open at {}", path.display());
        Ok(Self {
            path,
            tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written so far, timestamp markers included.
    pub fn lines_written(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn record(&self, event: JournalEvent) {
        let tx = self.tx.read();
        match tx.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(event) {
                    tracing::error!("Recovery journal writer is gone, dropping event: {:?}", e.into_inner());
                }
            }
            None => tracing::warn!("Recovery journal closed, dropping event: {:?}", event),
        }
    }

    pub fn added(&self, curi: &CrawlUri) {
        self.record(JournalEvent::Added {
            uri: curi.uri.clone(),
            path_from_seed: curi.path_from_seed.clone(),
            via: curi.via.clone(),
        });
    }

    pub fn emitted(&self, uri: &str) {
        self.record(JournalEvent::Emitted(uri.to_string()));
    }

    pub fn rescheduled(&self, uri: &str) {
        self.record(JournalEvent::Rescheduled(uri.to_string()));
    }

    pub fn succeeded(&self, uri: &str) {
        self.record(JournalEvent::Succeeded(uri.to_string()));
    }

    pub fn failed(&self, uri: &str) {
        self.record(JournalEvent::Failed(uri.to_string()));
    }

    pub fn error(&self, message: &str) {
        self.record(JournalEvent::Error(message.to_string()));
    }

    /// Drain outstanding events, finish the gzip stream and join the writer.
    /// Later calls are no-ops.
    pub fn close(&self) -> Result<(), JournalError> {
        // Dropping the sender lets the writer drain and exit.
        self.tx.write().take();
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| JournalError::WriterPanicked)?,
            None => Ok(()),
        }
    }

    fn writer_loop(
        mut encoder: GzEncoder<BufWriter<File>>,
        rx: Receiver<JournalEvent>,
        lines: Arc<AtomicU64>,
    ) -> Result<(), JournalError> {
        loop {
            let batch = Self::drain_batch(&rx);
            if batch.is_empty() {
                if rx.is_disconnected() {
                    break;
                }
                continue;
            }

            for event in &batch {
                writeln!(encoder, "{}", event.to_line())?;
                let written = lines.fetch_add(1, Ordering::Relaxed) + 1;
                if written % Config::JOURNAL_TIMESTAMP_INTERVAL == 0 {
                    writeln!(encoder, "{} {}", LOG_TIMESTAMP, timestamp())?;
                    lines.fetch_add(1, Ordering::Relaxed);
                }
            }
            encoder.flush()?;
        }

        let mut inner = encoder.finish()?;
        inner.flush()?;
        Ok(())
    }

    fn drain_batch(rx: &Receiver<JournalEvent>) -> Vec<JournalEvent> {
        let mut batch = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(Config::JOURNAL_BATCH_TIMEOUT_MS);

        match rx.recv_deadline(deadline) {
            Ok(event) => batch.push(event),
            Err(_) => return batch,
        }
        while batch.len() < Config::JOURNAL_MAX_BATCH {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }
}

impl Drop for RecoveryJournal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close recovery journal {}: {}", self.path.display(), e);
        }
    }
}

// ============================================================================
// READING
// ============================================================================

/// A parsed journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalLine {
    Added {
        uri: String,
        path_from_seed: String,
        via: Option<String>,
    },
    Emitted(String),
    Rescheduled(String),
    Succeeded(String),
    Failed(String),
    Timestamp(String),
    Error(String),
    Other(String),
}

impl JournalLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }
        let mut fields = line.split_whitespace();
        let tag = fields.next()?;
        let field = |f: Option<&str>| f.filter(|s| *s != EMPTY_FIELD).map(str::to_string);

        let parsed = match tag {
            F_ADD => {
                let uri = fields.next()?.to_string();
                JournalLine::Added {
                    uri,
                    path_from_seed: field(fields.next()).unwrap_or_default(),
                    via: field(fields.next()),
                }
            }
            F_EMIT => JournalLine::Emitted(fields.next()?.to_string()),
            F_RESCHEDULE => JournalLine::Rescheduled(fields.next()?.to_string()),
            F_SUCCESS => JournalLine::Succeeded(fields.next()?.to_string()),
            F_FAILURE => JournalLine::Failed(fields.next()?.to_string()),
            LOG_TIMESTAMP => JournalLine::Timestamp(fields.next().unwrap_or_default().to_string()),
            LOG_ERROR => JournalLine::Error(line[tag.len()..].trim().to_string()),
            _ => JournalLine::Other(line.to_string()),
        };
        Some(parsed)
    }
}

/// Line iterator over a journal, gzip'd or plain. A damaged or truncated tail
/// ends the iteration; `truncated()` reports whether that happened.
pub struct JournalReader {
    reader: Box<dyn BufRead + Send>,
    buf: String,
    lines_read: u64,
    truncated: bool,
    done: bool,
}

impl JournalReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, JournalError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let n = file.read(&mut magic)?;
        let file = File::open(path)?;

        let reader: Box<dyn BufRead + Send> = if n == 2 && magic == [0x1f, 0x8b] {
            Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file))))
        } else {
            Box::new(BufReader::new(file))
        };

        Ok(Self {
            reader,
            buf: String::new(),
            lines_read: 0,
            truncated: false,
            done: false,
        })
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for JournalReader {
    type Item = JournalLine;

    fn next(&mut self) -> Option<JournalLine> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.lines_read += 1;
                    if let Some(line) = JournalLine::parse(&self.buf) {
                        return Some(line);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Recovery journal ends early after {} lines: {}",
                        self.lines_read,
                        e
                    );
                    self.truncated = true;
                    self.done = true;
                }
            }
        }
        None
    }
}
