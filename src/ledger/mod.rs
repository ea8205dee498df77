//! Durable record of dispatch outcomes.
//!
//! The ledger is the source of truth for "was this entry already delivered"
//! across dispatcher restarts. The dispatcher writes an entry's outcome here
//! before it removes or advances the entry in the spool; a crash between the
//! two leaves an entry that is re-detected via [`Ledger::was_delivered`] and
//! settled without sending it again.

pub mod log;
pub mod record;

pub use log::{Ledger, LedgerError, Result};
#[cfg(test)]
pub(crate) use log::WriteFaults;
pub use record::{LedgerOutcome, LedgerRecord, LedgerTotals};
