//! Shared test utilities: proptest strategies and transport doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tokio::time::Instant;

use crate::transport::{Transport, TransportError};
use crate::types::{CorrelationId, Entry, EntryId};

// ─── Strategies ───

/// IDs that are safe as filenames.
pub fn arb_entry_id() -> impl Strategy<Value = EntryId> {
    "[a-zA-Z0-9][a-zA-Z0-9_-]{0,40}".prop_map(EntryId::new)
}

pub fn arb_correlation_id() -> impl Strategy<Value = CorrelationId> {
    "[a-z0-9-]{1,20}".prop_map(CorrelationId::new)
}

pub fn arb_payload() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,30}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
            prop::collection::btree_map("[a-z_]{1,10}", inner, 0..4)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap_or_default())
}

/// Well-formed entries of either kind, each with a fresh unique ID.
pub fn arb_entry() -> impl Strategy<Value = Entry> {
    prop_oneof![
        (arb_payload(), arb_timestamp()).prop_map(|(payload, created_at)| Entry {
            created_at,
            ..Entry::execution(payload)
        }),
        (arb_correlation_id(), arb_payload(), arb_timestamp()).prop_map(
            |(corr, payload, created_at)| Entry {
                created_at,
                ..Entry::remote_call(corr, payload)
            }
        ),
    ]
}

// ─── Transport doubles ───

/// One call observed by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub subject: String,
    pub body: Vec<u8>,
    /// Tokio clock at the moment `send` was called.
    pub at: Instant,
    pub succeeded: bool,
}

impl SentBatch {
    /// Decodes the body back into its entries.
    pub fn entries(&self) -> Vec<Entry> {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.entries().into_iter().map(|e| e.id).collect()
    }
}

/// A transport that succeeds or fails according to a script and records
/// every call.
///
/// Once the script runs out, every send succeeds.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<bool>>>,
    calls: Arc<Mutex<Vec<SentBatch>>>,
}

impl ScriptedTransport {
    /// Always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Follows `script` (`true` = success) then always succeeds.
    pub fn with_script(script: impl IntoIterator<Item = bool>) -> Self {
        let transport = Self::default();
        transport.script.lock().unwrap().extend(script);
        transport
    }

    /// Fails the first `n` sends.
    pub fn failing_first(n: usize) -> Self {
        Self::with_script(std::iter::repeat_n(false, n))
    }

    /// Fails every send.
    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX >> 48)
    }

    pub fn calls(&self) -> Vec<SentBatch> {
        self.calls.lock().unwrap().clone()
    }

    pub fn successful_calls(&self) -> Vec<SentBatch> {
        self.calls().into_iter().filter(|c| c.succeeded).collect()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, subject: &str, payload: &[u8]) -> Result<(), TransportError> {
        let succeeded = self.script.lock().unwrap().pop_front().unwrap_or(true);
        self.calls.lock().unwrap().push(SentBatch {
            subject: subject.to_string(),
            body: payload.to_vec(),
            at: Instant::now(),
            succeeded,
        });

        if succeeded {
            Ok(())
        } else {
            Err(TransportError::Unavailable("scripted failure".to_string()))
        }
    }
}

/// A transport whose sends never complete.
#[derive(Debug, Clone, Default)]
pub struct StalledTransport {
    started: Arc<Mutex<usize>>,
}

impl StalledTransport {
    /// Number of sends that have begun.
    pub fn started(&self) -> usize {
        *self.started.lock().unwrap()
    }
}

impl Transport for StalledTransport {
    async fn send(&self, _subject: &str, _payload: &[u8]) -> Result<(), TransportError> {
        *self.started.lock().unwrap() += 1;
        std::future::pending::<()>().await;
        Ok(())
    }
}
