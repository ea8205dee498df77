//! Durable staged storage for outbox entries.
//!
//! Each stage is a directory; each entry is one file inside exactly one stage
//! directory:
//!
//! ```text
//! pending/<id>.json            - execution waiting to be sent
//! staged/<id>.json             - remote call waiting to be sent
//! awaiting_response/<id>.json  - remote call sent, response outstanding
//! done/<id>.json               - remote call settled, pruned after a grace period
//! rejected/<id>.json           - entry that can never be sent
//! ```
//!
//! # Crash Safety
//!
//! - Entry files are written atomically (temp file + rename + fsync + dir fsync)
//! - Stage transitions are a single rename, so an entry is never in two stages
//! - `<id>.json.tmp` files are invisible to listing and swept at startup

pub mod drain;
pub mod store;

pub use store::{EntryRef, Result, Spool, SpoolError};
