//! Mail Outbox - a durable store-and-forward dispatcher.
//!
//! Producers spool entries to disk and return immediately. A dispatcher,
//! started on demand and guarded by a per-spool exclusion lock, drains the
//! spool in size-bounded batches through a [`transport::Transport`] and exits
//! once it has been idle for a while. A delivery ledger survives crashes so
//! nothing is sent twice after recovery.

pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod lock;
pub mod outbox;
pub mod persistence;
pub mod spool;
pub mod transport;
pub mod types;
pub mod watch;

#[cfg(test)]
mod test_utils;
