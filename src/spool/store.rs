//! Spool storage with atomic file operations.
//!
//! Each stage is a directory under the spool root holding one `<id>.json` file
//! per entry. Files become visible only through a rename, and move between
//! stages only through a rename.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::debug;

use crate::persistence::fsync::{remove_durable, rename_durable, write_atomic};
use crate::types::{Entry, EntryId, Stage};

/// Extension of a complete entry file.
pub(crate) const ENTRY_EXTENSION: &str = "json";

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error while writing an entry.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The entry is not in the expected stage (moved or removed concurrently).
    #[error("entry not found: {0}")]
    NotFound(EntryId),

    /// An entry with this ID already exists in the target stage.
    #[error("duplicate entry ID: {0}")]
    DuplicateEntry(EntryId),

    /// Entry ID contains path separators or other unsafe characters.
    #[error("invalid entry ID: contains unsafe characters: {0}")]
    InvalidEntryId(EntryId),

    /// Entry file exists but cannot be decoded into an entry.
    #[error("corrupt entry {id}: {reason}")]
    Corrupt { id: EntryId, reason: String },
}

impl SpoolError {
    /// True when the entry vanished between listing and access.
    ///
    /// Expected under concurrency; callers skip the entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpoolError::NotFound(_))
    }
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Validates that an entry ID is safe to use as a filename.
///
/// An entry ID is unsafe if it:
/// - Is empty
/// - Contains path separators (`/` or `\`) or null bytes
/// - Starts with a dot (hidden file, `.` or `..`)
fn validate_entry_id(id: &EntryId) -> Result<()> {
    let s = id.as_str();

    if s.is_empty() || s.contains('/') || s.contains('\\') || s.contains('\0') {
        return Err(SpoolError::InvalidEntryId(id.clone()));
    }

    if s.starts_with('.') {
        return Err(SpoolError::InvalidEntryId(id.clone()));
    }

    Ok(())
}

/// Maps a filesystem "not found" onto the entry-level `NotFound`.
fn not_found_as(id: &EntryId, e: io::Error) -> SpoolError {
    if e.kind() == io::ErrorKind::NotFound {
        SpoolError::NotFound(id.clone())
    } else {
        SpoolError::Io(e)
    }
}

/// A reference to an entry file in a particular stage.
///
/// Obtaining a reference does not guarantee the file still exists by the time
/// it is used; every operation on it may report `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub id: EntryId,
    pub stage: Stage,
    pub path: PathBuf,
}

/// Durable, directory-backed staged storage.
///
/// # Layout
///
/// ```text
/// <root>/
///   pending/<id>.json
///   staged/<id>.json
///   awaiting_response/<id>.json
///   done/<id>.json
///   rejected/<id>.json
/// ```
///
/// A `Spool` holds no in-memory state; any number of producers and one
/// dispatcher may hold their own `Spool` for the same root.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    /// Opens a spool at `root`, creating every stage directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let spool = Spool { root: root.into() };
        for stage in Stage::ALL {
            std::fs::create_dir_all(spool.stage_dir(stage))?;
        }
        Ok(spool)
    }

    /// Returns the spool root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of a stage.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// Builds a reference to where `id` would live in `stage`.
    pub fn locate(&self, stage: Stage, id: &EntryId) -> EntryRef {
        EntryRef {
            id: id.clone(),
            stage,
            path: self
                .stage_dir(stage)
                .join(format!("{}.{}", id.as_str(), ENTRY_EXTENSION)),
        }
    }

    /// Atomically materializes `entry` under `stage`.
    ///
    /// The entry is serialized and written with the write-to-temp-then-rename
    /// pattern, so `list` never observes a partially written entry.
    ///
    /// # Errors
    ///
    /// Returns `SpoolError::InvalidEntryId` for unsafe IDs,
    /// `SpoolError::DuplicateEntry` if the ID already exists in `stage`, and
    /// `SpoolError::Io` if the stage storage is unavailable.
    pub fn put(&self, stage: Stage, entry: &Entry) -> Result<EntryRef> {
        validate_entry_id(&entry.id)?;

        let stage_dir = self.stage_dir(stage);
        std::fs::create_dir_all(&stage_dir)?;

        let entry_ref = self.locate(stage, &entry.id);
        if entry_ref.path.exists() {
            return Err(SpoolError::DuplicateEntry(entry.id.clone()));
        }

        let bytes = serde_json::to_vec(entry)?;
        write_atomic(&entry_ref.path, &bytes)?;

        Ok(entry_ref)
    }

    /// Reads the raw bytes of an entry.
    pub fn read_bytes(&self, entry_ref: &EntryRef) -> Result<Vec<u8>> {
        std::fs::read(&entry_ref.path).map_err(|e| not_found_as(&entry_ref.id, e))
    }

    /// Reads and decodes an entry.
    ///
    /// # Errors
    ///
    /// Returns `SpoolError::NotFound` if the entry was moved or removed since
    /// it was listed, and `SpoolError::Corrupt` if the file does not decode to
    /// a well-formed entry carrying the same ID as its filename.
    pub fn read(&self, entry_ref: &EntryRef) -> Result<Entry> {
        let bytes = self.read_bytes(entry_ref)?;

        let entry: Entry = serde_json::from_slice(&bytes).map_err(|e| SpoolError::Corrupt {
            id: entry_ref.id.clone(),
            reason: e.to_string(),
        })?;

        if entry.id != entry_ref.id {
            return Err(SpoolError::Corrupt {
                id: entry_ref.id.clone(),
                reason: format!("file holds entry {}", entry.id),
            });
        }
        if !entry.is_well_formed() {
            return Err(SpoolError::Corrupt {
                id: entry_ref.id.clone(),
                reason: format!("{} entry with mismatched correlation id", entry.kind),
            });
        }

        Ok(entry)
    }

    /// Moves an entry to another stage with a single rename.
    ///
    /// The file's modification time is reset first, so it records when the
    /// entry entered its current stage.
    ///
    /// # Errors
    ///
    /// Returns `SpoolError::NotFound` if the entry is no longer in its stage
    /// (already moved: treat as handled).
    pub fn move_to(&self, entry_ref: &EntryRef, to: Stage) -> Result<EntryRef> {
        let target = self.locate(to, &entry_ref.id);
        std::fs::create_dir_all(self.stage_dir(to))?;

        let file = OpenOptions::new()
            .write(true)
            .open(&entry_ref.path)
            .map_err(|e| not_found_as(&entry_ref.id, e))?;
        if let Err(e) = file.set_modified(SystemTime::now()) {
            debug!(entry_id = %entry_ref.id, error = %e, "Could not restamp entry before move");
        }
        drop(file);

        rename_durable(&entry_ref.path, &target.path).map_err(|e| not_found_as(&entry_ref.id, e))?;

        Ok(target)
    }

    /// Removes an entry from its stage.
    ///
    /// # Errors
    ///
    /// Returns `SpoolError::NotFound` if the entry is already gone.
    pub fn remove(&self, entry_ref: &EntryRef) -> Result<()> {
        remove_durable(&entry_ref.path).map_err(|e| not_found_as(&entry_ref.id, e))
    }

    /// Finds which stage currently holds `id`, if any.
    pub fn find(&self, id: &EntryId) -> Result<Option<EntryRef>> {
        validate_entry_id(id)?;
        Ok(Stage::ALL
            .into_iter()
            .map(|stage| self.locate(stage, id))
            .find(|entry_ref| entry_ref.path.exists()))
    }
}
