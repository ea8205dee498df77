//! Newtype wrappers for outbox identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., passing a
//! correlation ID where an entry ID is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a spooled entry.
///
/// Used as the spool filename stem and as the ledger deduplication key, so it
/// must be unique across every producer writing into the same spool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    /// Wraps an existing identifier without validation.
    ///
    /// Filename safety is checked by the spool when the entry is written.
    pub fn new(s: impl Into<String>) -> Self {
        EntryId(s.into())
    }

    /// Generates a fresh, time-ordered identifier (UUIDv7).
    pub fn generate() -> Self {
        EntryId(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

/// Identifies the counterpart awaiting the response to a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new(s: impl Into<String>) -> Self {
        CorrelationId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The customer program an execution record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(pub String);

impl ProgramId {
    pub fn new(s: impl Into<String>) -> Self {
        ProgramId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<EntryId> = (0..1000).map(|_| EntryId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn generated_ids_are_filename_safe() {
        let id = EntryId::generate();
        assert!(!id.as_str().contains('/'));
        assert!(!id.as_str().contains('\\'));
        assert!(!id.as_str().starts_with('.'));
    }

    #[test]
    fn entry_id_serializes_transparently() {
        let id = EntryId::new("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
    }
}
