//! Spooled units of work and the stages they move through.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, EntryId, ProgramId};

/// What kind of work an entry carries, which decides its stage lifecycle.
///
/// ```text
/// Execution:   pending ──send──► (removed)
/// RemoteCall:  staged ──send──► awaiting_response ──response──► done ──prune──► (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Single-stage work: gone once delivered.
    Execution,
    /// Two-stage work: delivered, then parked until a response arrives.
    RemoteCall,
}

impl EntryKind {
    /// The stage a producer writes this kind of entry into.
    pub fn initial_stage(self) -> Stage {
        match self {
            EntryKind::Execution => Stage::Pending,
            EntryKind::RemoteCall => Stage::Staged,
        }
    }

    /// The stage an entry advances to after a successful send.
    ///
    /// `None` means the entry is removed from the spool.
    pub fn stage_after_send(self) -> Option<Stage> {
        match self {
            EntryKind::Execution => None,
            EntryKind::RemoteCall => Some(Stage::AwaitingResponse),
        }
    }

    /// Subject line used when a batch of this kind is handed to the transport.
    pub fn batch_subject(self) -> &'static str {
        match self {
            EntryKind::Execution => "Batched Executions",
            EntryKind::RemoteCall => "Remote Calls",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Execution => write!(f, "execution"),
            EntryKind::RemoteCall => write!(f, "remote_call"),
        }
    }
}

/// A named bucket within the spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Execution entries waiting to be sent.
    Pending,
    /// Remote-call requests waiting to be sent.
    Staged,
    /// Remote-call requests sent, waiting for the counterpart's response.
    AwaitingResponse,
    /// Remote calls whose response arrived; pruned after a grace period.
    Done,
    /// Entries that can never be sent (undecodable or over the batch ceiling).
    Rejected,
}

impl Stage {
    /// Every stage, in the order they are created on disk.
    pub const ALL: [Stage; 5] = [
        Stage::Pending,
        Stage::Staged,
        Stage::AwaitingResponse,
        Stage::Done,
        Stage::Rejected,
    ];

    /// Stages the dispatcher drains, in drain priority order.
    pub const DISPATCHABLE: [Stage; 2] = [Stage::Pending, Stage::Staged];

    /// Directory name of this stage under the spool root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Staged => "staged",
            Stage::AwaitingResponse => "awaiting_response",
            Stage::Done => "done",
            Stage::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One unit of work, immutable once written to the spool.
///
/// The serialized form of an entry is both its on-disk representation and its
/// element in a batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Opaque JSON document. The dispatcher never inspects it.
    pub payload: serde_json::Value,
}

impl Entry {
    /// Creates an execution entry with a fresh identity.
    pub fn execution(payload: serde_json::Value) -> Self {
        Entry {
            id: EntryId::generate(),
            kind: EntryKind::Execution,
            created_at: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    /// Creates a remote-call request with a fresh identity.
    pub fn remote_call(correlation_id: CorrelationId, payload: serde_json::Value) -> Self {
        Entry {
            id: EntryId::generate(),
            kind: EntryKind::RemoteCall,
            created_at: Utc::now(),
            correlation_id: Some(correlation_id),
            payload,
        }
    }

    /// Remote calls must name their counterpart; executions must not.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            EntryKind::Execution => self.correlation_id.is_none(),
            EntryKind::RemoteCall => self.correlation_id.is_some(),
        }
    }
}

/// Payload of an execution entry created through the producer API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: EntryId,
    pub program_id: ProgramId,
    pub created_at: DateTime<Utc>,
}
