//! Durable filesystem primitives.
//!
//! Every visible change to the spool goes through one of these functions:
//! atomic creation via temp file + rename, and atomic moves via rename. Both
//! are followed by a directory fsync so the new directory entry survives a
//! power loss.
//!
//! # Why Directory fsync?
//!
//! On POSIX systems, creating or renaming a file updates the directory entry.
//! Without fsync on the directory, this entry may not survive a power loss
//! even if the file contents were synced.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix appended to a file name while its contents are being written.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory to disk, ensuring directory entries are durable.
///
/// # Errors
///
/// Returns an error if the path doesn't exist or if the fsync system call fails.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Returns the temp path used while `path` is being written.
///
/// The temp file lives in the same directory so the final rename never crosses
/// a filesystem boundary.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Writes `bytes` to `path` so that readers observe either nothing or the
/// complete contents.
///
/// 1. Write to `<name>.tmp`
/// 2. fsync the temp file
/// 3. Rename to `<name>`
/// 4. fsync the directory
///
/// An existing file at `path` is replaced. Callers that need create-only
/// semantics check for existence first.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Moves `from` to `to` with a single rename, then makes both directory
/// entries durable.
///
/// Both paths must be on the same filesystem. There is no copy fallback: a
/// copy + delete would open a window where the file exists twice.
pub fn rename_durable(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::rename(from, to)?;

    let to_parent = to.parent();
    if let Some(parent) = to_parent {
        fsync_dir(parent)?;
    }
    if let Some(parent) = from.parent()
        && Some(parent) != to_parent
    {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Removes `path` and makes the removal durable.
pub fn remove_durable(path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}
