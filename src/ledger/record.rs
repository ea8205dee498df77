//! Ledger record types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EntryId;

/// Terminal outcome of dispatching one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// The transport accepted a batch containing the entry.
    Sent,
    /// The entry can never be sent and was moved to the rejected stage.
    Failed,
}

impl fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerOutcome::Sent => write!(f, "sent"),
            LedgerOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One line of the ledger file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Monotonically increasing position in the ledger.
    pub seq: u64,
    pub id: EntryId,
    pub outcome: LedgerOutcome,
    pub ts: DateTime<Utc>,
}

/// Outcome counts over the whole ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub sent: u64,
    pub failed: u64,
}

impl LedgerTotals {
    pub fn add(&mut self, outcome: LedgerOutcome) {
        match outcome {
            LedgerOutcome::Sent => self.sent += 1,
            LedgerOutcome::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_as_flat_json_object() {
        let record = LedgerRecord {
            seq: 7,
            id: EntryId::new("abc"),
            outcome: LedgerOutcome::Sent,
            ts: DateTime::from_timestamp(0, 0).unwrap(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["id"], "abc");
        assert_eq!(value["outcome"], "sent");
    }

    #[test]
    fn totals_count_by_outcome() {
        let mut totals = LedgerTotals::default();
        totals.add(LedgerOutcome::Sent);
        totals.add(LedgerOutcome::Sent);
        totals.add(LedgerOutcome::Failed);
        assert_eq!(totals, LedgerTotals { sent: 2, failed: 1 });
    }
}
