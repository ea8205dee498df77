//! The dispatcher: drains the spool in size-bounded batches through a
//! transport, with backoff on failure and exit on idle.
//!
//! # Architecture
//!
//! A dispatcher is not a daemon. It is started on demand (by a producer or
//! the CLI), holds the spool's exclusion lock while it runs, and exits after
//! an idle period. At most one dispatcher per spool is ever active; a second
//! one finds the lock busy and returns immediately.
//!
//! # Components
//!
//! - [`config`]: tunables and their environment overrides
//! - [`backoff`]: doubling wait between failed sends
//! - [`batch`]: size-bounded batch bodies
//! - [`dispatcher`]: the control loop

pub mod backoff;
pub mod batch;
pub mod config;
pub mod dispatcher;


pub use backoff::Backoff;
pub use batch::{Batch, BatchBuilder, Push};
pub use config::DispatcherConfig;
pub use dispatcher::{
    DispatchError, Dispatcher, ExitReason, LEDGER_FILE_NAME, Result, RunSummary,
};
