//! Cross-process exclusion lock bounding active dispatchers to one per spool.
//!
//! The lock is an advisory OS file lock on `<root>/dispatcher.lock`. It is
//! released when the [`ExclusionLock`] is dropped or when the holding process
//! exits for any reason, so a crashed dispatcher never wedges the spool.
//!
//! The lock file also records who holds it, for operators:
//!
//! ```json
//! {"pid": 4242, "acquired_at": "2024-01-01T12:00:00Z"}
//! ```
//!
//! The file itself is never deleted; removing it would let a second
//! contender lock a fresh inode while the first still holds the old one.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::persistence::fsync::fsync_file;

/// Name of the lock file under the spool root.
pub const LOCK_FILE_NAME: &str = "dispatcher.lock";

/// How often a contender re-checks a busy lock while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that can occur while acquiring the lock.
///
/// A lock held by someone else is not an error; see [`LockOutcome::Busy`].
#[derive(Debug, Error)]
pub enum LockError {
    /// IO error opening or locking the lock file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error reading or writing holder info.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Who holds the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Result of trying to acquire the lock.
#[derive(Debug)]
pub enum LockOutcome {
    /// This caller is now the active dispatcher.
    Acquired(ExclusionLock),
    /// Another dispatcher holds the lock; the caller should not start.
    Busy,
}

/// A held exclusion lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct ExclusionLock {
    file: File,
    path: PathBuf,
    holder: LockHolder,
}

fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE_NAME)
}

impl ExclusionLock {
    /// Tries to acquire the lock, waiting at most `timeout` for a current
    /// holder to let go.
    ///
    /// Returns `LockOutcome::Busy` if the lock is still held when the timeout
    /// expires. A zero timeout makes a single attempt.
    pub async fn try_acquire(root: &Path, timeout: Duration) -> Result<LockOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(lock) = Self::try_acquire_now(root)? {
                debug!(path = %lock.path.display(), "Exclusion lock acquired");
                return Ok(LockOutcome::Acquired(lock));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(root = %root.display(), "Exclusion lock busy");
                return Ok(LockOutcome::Busy);
            }

            trace!(root = %root.display(), "Exclusion lock held elsewhere, waiting");
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Makes one non-blocking acquisition attempt.
    ///
    /// Returns `Ok(None)` if the lock is held elsewhere.
    pub fn try_acquire_now(root: &Path) -> Result<Option<ExclusionLock>> {
        std::fs::create_dir_all(root)?;
        let path = lock_path(root);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&holder)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;

        Ok(Some(ExclusionLock { file, path, holder }))
    }

    /// Returns who acquired this lock.
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Returns the path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock now rather than at drop.
    pub fn release(self) {
        if let Err(e) = self.file.unlock() {
            debug!(error = %e, "Explicit unlock failed; lock released on close");
        }
        debug!(path = %self.path.display(), "Exclusion lock released");
    }

    /// Reads the holder info last written to the lock file under `root`.
    ///
    /// The info is left behind after release, so it names the most recent
    /// holder, not necessarily a live one. Combine with [`Self::is_held`].
    pub fn read_holder(root: &Path) -> Result<Option<LockHolder>> {
        let mut file = match File::open(lock_path(root)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// True if some dispatcher currently holds the lock under `root`.
    pub fn is_held(root: &Path) -> Result<bool> {
        let file = match OpenOptions::new().read(true).write(true).open(lock_path(root)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match file.try_lock() {
            Ok(()) => Ok(false),
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }
}
