//! Reading the queue back out of the spool.
//!
//! Listing, counting, and the maintenance passes that keep stage directories
//! free of crash leftovers and settled entries.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::persistence::fsync::{TEMP_SUFFIX, fsync_dir};
use crate::types::{EntryId, Stage};

use super::store::{ENTRY_EXTENSION, EntryRef, Result, Spool};

/// Extracts the entry ID from a complete entry file name.
///
/// Returns `None` for temp files, hidden files, and anything that is not
/// `<id>.json`.
fn entry_id_from_path(path: &Path) -> Option<EntryId> {
    if path.extension()? != ENTRY_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(EntryId::new(stem))
}

/// Iterates the paths in `dir`, skipping entries that vanish mid-iteration.
///
/// A missing directory yields nothing.
fn dir_paths(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    for dir_entry in read_dir {
        match dir_entry {
            Ok(dir_entry) => paths.push(dir_entry.path()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(paths)
}

/// True if `path` was last modified before `cutoff`.
///
/// Files that vanish or report no mtime are treated as not old.
fn modified_before(path: &Path, cutoff: SystemTime) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .is_ok_and(|modified| modified < cutoff)
}

/// `now - age`, saturating at the epoch.
fn cutoff_for(age: Duration) -> SystemTime {
    SystemTime::now()
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

impl Spool {
    /// Snapshots the complete entries currently in `stage`.
    ///
    /// Entries are returned sorted by ID, which for generated IDs is creation
    /// order. Entries added during or after the call may be missed; entries
    /// removed concurrently may still be reported, so every subsequent access
    /// must tolerate `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage directory exists but cannot be read.
    pub fn list(&self, stage: Stage) -> Result<Vec<EntryRef>> {
        let mut entries: Vec<EntryRef> = dir_paths(&self.stage_dir(stage))?
            .into_iter()
            .filter_map(|path| {
                entry_id_from_path(&path).map(|id| EntryRef { id, stage, path })
            })
            .collect();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Returns the number of complete entries in `stage`.
    ///
    /// This is a lightweight check that doesn't read entry contents.
    pub fn count(&self, stage: Stage) -> Result<usize> {
        Ok(dir_paths(&self.stage_dir(stage))?
            .iter()
            .filter(|path| entry_id_from_path(path).is_some())
            .count())
    }

    /// Returns true if any dispatchable stage holds an entry.
    pub fn has_dispatchable(&self) -> Result<bool> {
        for stage in Stage::DISPATCHABLE {
            if self.count(stage)? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes temp files left behind by writers that crashed mid-write.
    ///
    /// Only temp files older than `min_age` are removed, so a writer that is
    /// still running keeps its temp file. Returns the number removed.
    ///
    /// # Durability
    ///
    /// Each stage directory that lost a file is fsynced once at the end.
    pub fn cleanup_orphaned_temp_files(&self, min_age: Duration) -> Result<usize> {
        let cutoff = cutoff_for(min_age);
        let mut removed = 0;

        for stage in Stage::ALL {
            let stage_dir = self.stage_dir(stage);
            let mut removed_here = false;

            for path in dir_paths(&stage_dir)? {
                let is_temp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(TEMP_SUFFIX));

                if is_temp && modified_before(&path, cutoff) && std::fs::remove_file(&path).is_ok()
                {
                    removed += 1;
                    removed_here = true;
                }
            }

            if removed_here {
                fsync_dir(&stage_dir)?;
            }
        }

        Ok(removed)
    }

    /// Removes `done` entries that settled more than `grace` ago.
    ///
    /// Returns the number removed.
    pub fn prune_done(&self, grace: Duration) -> Result<usize> {
        let cutoff = cutoff_for(grace);
        let mut removed = 0;

        for entry_ref in self.list(Stage::Done)? {
            if !modified_before(&entry_ref.path, cutoff) {
                continue;
            }
            match self.remove(&entry_ref) {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(removed)
    }
}
