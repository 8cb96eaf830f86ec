//! Durable backends for the match ledger.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::StoreError;

use super::LedgerEntry;

/// Append-only storage with at-least-once semantics.
///
/// `append` returns `Ok` only once the entry is durable. `load` may return an
/// entry more than once; the ledger deduplicates on replay.
pub trait LedgerStore: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError>;
    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError>;
}

impl<S: LedgerStore + ?Sized> LedgerStore for Arc<S> {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        (**self).append(entry)
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).load()
    }
}

/// In-process store. Survives an engine restart as long as the value is shared.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
    failures_remaining: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.entries.lock().clone())
    }
}

/// JSON-lines file; every append is flushed and synced before returning.
///
/// A write that failed part way is cut off again, at append time or on the
/// next `open`, so later entries always start on a fresh line.
#[derive(Debug)]
pub struct JsonlLedgerStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        let complete = complete_len(&path)?;
        if complete < len {
            warn!(
                path = %path.display(),
                torn_bytes = len - complete,
                "truncating torn ledger tail"
            );
            file.set_len(complete)?;
            file.sync_data()?;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        let start = file.metadata()?.len();
        if let Err(err) = write_synced(&mut file, &line) {
            if let Err(undo) = file.set_len(start) {
                warn!(path = %self.path.display(), error = %undo, "could not cut off a partial ledger write");
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        let last = lines.len().saturating_sub(1);
        let mut entries = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line is a write that never returned Ok.
                Err(err) if number == last => {
                    warn!(path = %self.path.display(), error = %err, "dropping torn ledger tail");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(entries)
    }
}

fn write_synced(file: &mut File, line: &[u8]) -> io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    file.sync_data()
}

/// Length of the file up to and including its last newline.
fn complete_len(path: &Path) -> Result<u64, StoreError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut complete = 0u64;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            complete += read as u64;
        }
    }
    Ok(complete)
}
