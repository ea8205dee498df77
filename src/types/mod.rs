//! Core domain types for the outbox.

pub mod entry;
pub mod ids;

pub use entry::{Entry, EntryKind, ExecutionRecord, Stage};
pub use ids::{CorrelationId, EntryId, ProgramId};
