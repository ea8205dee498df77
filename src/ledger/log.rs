//! Append-only delivery ledger with crash-safe replay.
//!
//! The ledger uses JSON Lines format: one [`LedgerRecord`] per line.
//! This format is crash-safe because:
//! - Complete lines are always valid JSON
//! - Partial lines (from crash mid-write) are detected and truncated on open
//!
//! # fsync Strategy
//!
//! Every record is fsynced before `record` returns. The dispatcher relies on
//! this: a `Sent` record must be durable before the entry leaves the spool.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

use crate::persistence::fsync::fsync_file;
use crate::types::EntryId;

use super::record::{LedgerOutcome, LedgerRecord, LedgerTotals};

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A failed append could not be rolled back; the file may end in a torn
    /// line. Reopening truncates it.
    #[error("ledger {path} needs reopening after a failed rollback")]
    Poisoned { path: PathBuf },
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// The valid prefix of a ledger file.
struct Replay {
    records: Vec<LedgerRecord>,
    /// Byte length of the valid prefix.
    valid_len: u64,
    /// Byte length of the file as found.
    file_len: u64,
}

/// Reads records from the start of `path` up to the first torn or
/// out-of-sequence line.
///
/// A missing file is an empty ledger.
fn read_valid_prefix(path: &Path) -> Result<Replay> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Replay {
                records: Vec::new(),
                valid_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut max_seq: Option<u64> = None;

    loop {
        let mut line = String::new();
        let bytes_read = match reader.read_line(&mut line) {
            Ok(n) => n,
            // Torn multi-byte character at the tail.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
            Err(e) => return Err(e.into()),
        };

        if bytes_read == 0 {
            break;
        }

        // A line without its newline was cut off mid-write.
        if !line.ends_with('\n') {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            valid_len += bytes_read as u64;
            continue;
        }

        match serde_json::from_str::<LedgerRecord>(trimmed) {
            Ok(record) => {
                if max_seq.is_some_and(|prev_max| record.seq <= prev_max) {
                    break;
                }
                max_seq = Some(record.seq);
                records.push(record);
                valid_len += bytes_read as u64;
            }
            Err(_) => break,
        }
    }

    Ok(Replay {
        records,
        valid_len,
        file_len,
    })
}

/// The durable record of dispatch outcomes, keyed by entry ID.
///
/// Only the dispatcher holding the exclusion lock opens a `Ledger` for
/// writing. Other processes use [`Ledger::scan`], which never modifies the
/// file.
pub struct Ledger {
    /// The underlying file handle, opened for append.
    file: File,
    /// Path to the ledger file.
    path: PathBuf,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Byte length of the file after the last successful record.
    len: u64,
    /// Latest outcome per entry; `Sent` is never downgraded.
    index: HashMap<EntryId, LedgerOutcome>,
    totals: LedgerTotals,
    /// Set when a torn append could not be cut back.
    poisoned: bool,
    #[cfg(test)]
    faults: WriteFaults,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("next_seq", &self.next_seq)
            .field("entries", &self.index.len())
            .finish()
    }
}

impl Ledger {
    /// Opens the ledger at `path`, creating it if missing.
    ///
    /// Existing records are replayed into the in-memory index. If the final
    /// line is incomplete (crash mid-write), the file is truncated at the
    /// start of that line so the ledger always holds a valid prefix.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let replay = read_valid_prefix(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        if replay.valid_len < replay.file_len {
            file.set_len(replay.valid_len)?;
            fsync_file(&file)?;
        }

        let mut ledger = Ledger {
            file,
            path,
            next_seq: replay.records.last().map(|r| r.seq + 1).unwrap_or(0),
            len: replay.valid_len,
            index: HashMap::new(),
            totals: LedgerTotals::default(),
            poisoned: false,
            #[cfg(test)]
            faults: WriteFaults::default(),
        };
        for record in &replay.records {
            ledger.apply(record);
        }

        Ok(ledger)
    }

    /// Reads every complete record without modifying the file.
    ///
    /// Safe to call while a dispatcher is appending: a torn tail is ignored
    /// rather than truncated.
    pub fn scan(path: impl AsRef<Path>) -> Result<Vec<LedgerRecord>> {
        Ok(read_valid_prefix(path.as_ref())?.records)
    }

    fn apply(&mut self, record: &LedgerRecord) {
        self.totals.add(record.outcome);
        let current = self.index.entry(record.id.clone()).or_insert(record.outcome);
        if record.outcome == LedgerOutcome::Sent {
            *current = LedgerOutcome::Sent;
        }
    }

    /// Durably appends an outcome for `id`.
    ///
    /// Recording an outcome the ledger already holds for `id` is a no-op, so
    /// each ID carries at most one record per outcome. Returns the record
    /// written, if any.
    ///
    /// # Errors
    ///
    /// On IO failure the file is cut back to its previous length and the
    /// in-memory index is unchanged; the caller must not treat the entry as
    /// settled. If the cut itself fails the ledger is poisoned and every
    /// later call returns `LedgerError::Poisoned` until it is reopened.
    pub fn record(
        &mut self,
        id: &EntryId,
        outcome: LedgerOutcome,
        ts: DateTime<Utc>,
    ) -> Result<Option<LedgerRecord>> {
        if self.poisoned {
            return Err(LedgerError::Poisoned {
                path: self.path.clone(),
            });
        }
        if self.has_recorded(id, outcome) {
            return Ok(None);
        }

        let record = LedgerRecord {
            seq: self.next_seq,
            id: id.clone(),
            outcome,
            ts,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Err(e) = self.append(&line) {
            if let Err(rollback) = self.truncate_to_valid() {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Could not roll back a failed ledger append; ledger poisoned"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }

        self.len += line.len() as u64;
        self.next_seq += 1;
        self.apply(&record);
        Ok(Some(record))
    }

    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if self.faults.take_append() {
            // Leave a torn half-line behind, as a crash mid-write would.
            self.file.write_all(&line[..line.len() / 2])?;
            return Err(io::Error::other("scripted append failure"));
        }
        self.file.write_all(line)?;
        fsync_file(&self.file)
    }

    /// Cuts the file back to the end of the last good record.
    fn truncate_to_valid(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if self.faults.take_rollback() {
            return Err(io::Error::other("scripted rollback failure"));
        }
        self.file.set_len(self.len)?;
        fsync_file(&self.file)
    }

    /// True once a failed rollback has left the file in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[cfg(test)]
    pub(crate) fn with_faults(mut self, faults: WriteFaults) -> Self {
        self.faults = faults;
        self
    }

    fn has_recorded(&self, id: &EntryId, outcome: LedgerOutcome) -> bool {
        match (self.index.get(id), outcome) {
            (Some(LedgerOutcome::Sent), _) => true,
            (Some(LedgerOutcome::Failed), LedgerOutcome::Failed) => true,
            _ => false,
        }
    }

    /// True if an outcome of `Sent` has been recorded for `id`.
    pub fn was_delivered(&self, id: &EntryId) -> bool {
        self.index.get(id) == Some(&LedgerOutcome::Sent)
    }

    /// The settled outcome for `id`, if any.
    pub fn outcome(&self, id: &EntryId) -> Option<LedgerOutcome> {
        self.index.get(id).copied()
    }

    /// Outcome counts over every record in the ledger.
    pub fn totals(&self) -> LedgerTotals {
        self.totals
    }

    /// Returns the next sequence number that will be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Returns the path to the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scripted write failures for exercising the error paths of [`Ledger`].
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteFaults {
    appends: std::sync::Arc<std::sync::atomic::AtomicU32>,
    rollbacks: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

#[cfg(test)]
impl WriteFaults {
    /// Fails the next `n` appends, each leaving a torn half-line.
    pub(crate) fn fail_appends(&self, n: u32) {
        self.appends.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fails the next `n` rollbacks of a failed append.
    pub(crate) fn fail_rollbacks(&self, n: u32) {
        self.rollbacks.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn take_append(&self) -> bool {
        Self::take(&self.appends)
    }

    fn take_rollback(&self) -> bool {
        Self::take(&self.rollbacks)
    }

    fn take(counter: &std::sync::atomic::AtomicU32) -> bool {
        use std::sync::atomic::Ordering;
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
