//! Low-level durability helpers shared by the spool, ledger, lock and
//! pickup transport.
//!
//! # Crash Safety
//!
//! - New files are written atomically using write-to-temp-then-rename
//! - Stage transitions are single renames, never copy + delete
//! - All critical operations fsync both the file and its directory

pub mod fsync;

pub use fsync::{
    TEMP_SUFFIX, fsync_dir, fsync_file, remove_durable, rename_durable, temp_path_for,
    write_atomic,
};
