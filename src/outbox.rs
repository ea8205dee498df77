//! Producer handle and on-demand dispatcher supervision.
//!
//! An [`Outbox`] is what application code holds. Creating an entry spools it
//! durably, wakes a sleeping dispatcher, and makes sure a dispatcher task is
//! running, spawning one only if none is alive:
//!
//! ```text
//! create_execution ──► Spool::put ──► wake ──► ensure_dispatcher
//!                                                 │
//!                                   task alive? ──┴── no ──► spawn Dispatcher::run
//! ```
//!
//! The spawned task ends when its dispatcher goes idle. A dispatcher that finds
//! the exclusion lock busy (another process is already draining this spool)
//! ends at once; the other process delivers the entry.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{ConfigError, Settings};
use crate::dispatch::batch::EMPTY_BATCH_BYTES;
use crate::dispatch::{Dispatcher, DispatcherConfig, ExitReason, RunSummary};
use crate::spool::{EntryRef, Spool, SpoolError};
use crate::transport::{PickupDirTransport, Transport};
use crate::types::{CorrelationId, Entry, EntryId, ExecutionRecord, ProgramId, Stage};

/// Errors that can occur while producing entries.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Spool error while writing or moving an entry.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// JSON error serializing a payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The entry could never fit in a batch.
    #[error("entry {id} is {size} bytes; batches are limited to {max} bytes")]
    EntryTooLarge { id: EntryId, size: usize, max: usize },

    /// The entry's kind and correlation ID disagree.
    #[error("malformed entry {0}: correlation id does not match kind")]
    MalformedEntry(EntryId),

    /// The remote call is not waiting for a response.
    #[error("remote call {0} is not awaiting a response")]
    NotAwaitingResponse(EntryId),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// The supervised dispatcher task, tagged so a finished task only clears
/// its own slot.
struct Running {
    generation: u64,
    handle: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<Running>>>;

/// Producer-side handle on one spool.
pub struct Outbox<T> {
    spool: Spool,
    dispatcher: Arc<Dispatcher<T>>,
    max_batch_bytes: usize,
    task: Slot,
    generation: AtomicU64,
    last_run: Arc<std::sync::Mutex<Option<RunSummary>>>,
    shutdown: CancellationToken,
}

impl Outbox<PickupDirTransport> {
    /// Builds an outbox delivering through the pickup directory in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let transport = PickupDirTransport::from_settings(&settings.transport);
        Self::open(&settings.spool_dir, transport, settings.dispatcher.clone())
    }
}

impl<T: Transport + Send + Sync + 'static> Outbox<T> {
    /// Opens the spool at `spool_dir` (creating it if needed).
    pub fn open(
        spool_dir: impl Into<PathBuf>,
        transport: T,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let spool = Spool::open(spool_dir)?;
        let max_batch_bytes = config.max_batch_bytes;
        let dispatcher = Dispatcher::new(spool.clone(), transport, config);

        Ok(Outbox {
            spool,
            dispatcher: Arc::new(dispatcher),
            max_batch_bytes,
            task: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            last_run: Arc::new(std::sync::Mutex::new(None)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Records that `program_id` executed, for batched delivery.
    #[instrument(skip(self), fields(program = %program_id))]
    pub async fn create_execution(&self, program_id: &ProgramId) -> Result<EntryId> {
        let execution_id = EntryId::generate();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            program_id: program_id.clone(),
            created_at: Utc::now(),
        };

        let entry = Entry {
            id: execution_id,
            created_at: record.created_at,
            ..Entry::execution(serde_json::to_value(&record)?)
        };
        self.enqueue(entry).await
    }

    /// Stages a remote-call request addressed to `correlation_id`.
    pub async fn stage_remote_call(
        &self,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Result<EntryId> {
        self.enqueue(Entry::remote_call(correlation_id, payload)).await
    }

    /// Spools `entry` in its kind's initial stage and makes sure it will be
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns `OutboxError::EntryTooLarge` for an entry that could never fit
    /// in a batch, and `OutboxError::Spool` if the spool cannot be written.
    pub async fn enqueue(&self, entry: Entry) -> Result<EntryId> {
        if !entry.is_well_formed() {
            return Err(OutboxError::MalformedEntry(entry.id));
        }

        let size = serde_json::to_vec(&entry)?.len();
        if size + EMPTY_BATCH_BYTES > self.max_batch_bytes {
            return Err(OutboxError::EntryTooLarge {
                id: entry.id,
                size,
                max: self.max_batch_bytes,
            });
        }

        let stage = entry.kind.initial_stage();
        self.spool.put(stage, &entry)?;
        debug!(entry_id = %entry.id, kind = %entry.kind, %stage, "Entry spooled");

        self.dispatcher.wake_signal().wake();
        self.ensure_dispatcher().await;
        Ok(entry.id)
    }

    /// Marks a remote call's response as received: `awaiting_response → done`.
    pub fn complete_remote_call(&self, id: &EntryId) -> Result<EntryRef> {
        let awaiting = self.spool.locate(Stage::AwaitingResponse, id);
        match self.spool.move_to(&awaiting, Stage::Done) {
            Ok(done) => {
                debug!(entry_id = %id, "Remote call completed");
                Ok(done)
            }
            Err(e) if e.is_not_found() => Err(OutboxError::NotAwaitingResponse(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes completed remote calls older than `grace`.
    pub fn prune_done(&self, grace: Duration) -> Result<usize> {
        Ok(self.spool.prune_done(grace)?)
    }

    /// Spawns a dispatcher task unless one is already alive.
    ///
    /// Returns true if a task was spawned.
    pub async fn ensure_dispatcher(&self) -> bool {
        let mut slot = self.task.lock().await;
        if slot.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.dispatcher),
            self.shutdown.child_token(),
            Arc::clone(&self.task),
            Arc::clone(&self.last_run),
            generation,
        ));
        debug!(generation, "Dispatcher task spawned");

        *slot = Some(Running { generation, handle });
        true
    }

    /// True while a dispatcher task spawned by this outbox is alive.
    pub async fn is_dispatcher_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Summary of the most recently finished dispatcher run.
    pub fn last_run(&self) -> Option<RunSummary> {
        self.last_run.lock().ok().and_then(|s| s.clone())
    }

    /// Cancels the dispatcher task, if any, and waits for it to finish.
    ///
    /// Entries not yet delivered stay in the spool.
    pub async fn shutdown(&self) {
        info!("Shutting down outbox");
        self.shutdown.cancel();

        let running = self.task.lock().await.take();
        if let Some(running) = running
            && let Err(e) = running.handle.await
        {
            error!(error = %e, "Dispatcher task panicked");
        }
    }
}

/// Body of a spawned dispatcher task.
///
/// A dispatcher that goes idle on an empty spool may have just missed an
/// entry whose producer saw this task still alive and therefore did not
/// spawn another. The final check runs under the slot lock, so either the
/// producer sees the slot cleared and spawns, or this task sees the entry
/// and runs again.
async fn supervise<T: Transport + Send + Sync + 'static>(
    dispatcher: Arc<Dispatcher<T>>,
    cancel: CancellationToken,
    slot: Slot,
    last_run: Arc<std::sync::Mutex<Option<RunSummary>>>,
    generation: u64,
) {
    loop {
        let may_restart = match dispatcher.run(cancel.clone()).await {
            Ok(summary) => {
                let may_restart = summary.exit == ExitReason::Idle && !summary.left_pending;
                if let Ok(mut last) = last_run.lock() {
                    *last = Some(summary);
                }
                may_restart
            }
            Err(e) => {
                error!(error = %e, "Dispatcher task failed");
                false
            }
        };

        let mut running = slot.lock().await;
        let has_work = match dispatcher.spool().has_dispatchable() {
            Ok(has_work) => has_work,
            Err(e) => {
                error!(error = %e, "Could not check spool for new entries");
                false
            }
        };
        if may_restart && has_work && !cancel.is_cancelled() {
            debug!(generation, "Entries arrived as the dispatcher went idle, restarting");
            continue;
        }

        if running.as_ref().is_some_and(|r| r.generation == generation) {
            *running = None;
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ExclusionLock;
    use crate::test_utils::ScriptedTransport;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn outbox_with(transport: ScriptedTransport) -> (TempDir, Outbox<ScriptedTransport>) {
        let dir = tempdir().unwrap();
        let config = DispatcherConfig {
            watch_interval: None,
            ..DispatcherConfig::new()
        };
        let outbox = Outbox::open(dir.path().join("outbox"), transport, config).unwrap();
        (dir, outbox)
    }

    async fn wait_for_calls(transport: &ScriptedTransport, n: usize) {
        while transport.calls().len() < n {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_execution_is_delivered_with_execution_record() {
        let transport = ScriptedTransport::new();
        let (_dir, outbox) = outbox_with(transport.clone());

        let id = outbox
            .create_execution(&ProgramId::new("prog-7"))
            .await
            .unwrap();
        wait_for_calls(&transport, 1).await;

        let sent = &transport.calls()[0];
        assert_eq!(sent.subject, "Batched Executions");
        let entries = sent.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        let record: ExecutionRecord = serde_json::from_value(entries[0].payload.clone()).unwrap();
        assert_eq!(record.execution_id, id);
        assert_eq!(record.program_id, ProgramId::new("prog-7"));

        outbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_task_serves_many_producers() {
        let transport = ScriptedTransport::new();
        let (_dir, outbox) = outbox_with(transport.clone());

        outbox
            .create_execution(&ProgramId::new("a"))
            .await
            .unwrap();
        assert!(outbox.is_dispatcher_running().await);
        assert!(!outbox.ensure_dispatcher().await);

        outbox
            .create_execution(&ProgramId::new("b"))
            .await
            .unwrap();
        assert!(!outbox.ensure_dispatcher().await);

        outbox.shutdown().await;
        assert!(!outbox.is_dispatcher_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_exits_when_idle_and_restarts_on_demand() {
        let transport = ScriptedTransport::new();
        let (_dir, outbox) = outbox_with(transport.clone());

        outbox
            .create_execution(&ProgramId::new("first"))
            .await
            .unwrap();
        wait_for_calls(&transport, 1).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(!outbox.is_dispatcher_running().await);
        let last = outbox.last_run().unwrap();
        assert_eq!(last.exit, ExitReason::Idle);
        assert_eq!(last.entries_sent, 1);

        outbox
            .create_execution(&ProgramId::new("second"))
            .await
            .unwrap();
        assert!(outbox.is_dispatcher_running().await);
        wait_for_calls(&transport, 2).await;

        outbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_leaves_delivery_to_the_other_dispatcher() {
        let transport = ScriptedTransport::new();
        let (_dir, outbox) = outbox_with(transport.clone());
        let _other = ExclusionLock::try_acquire_now(outbox.spool().root())
            .unwrap()
            .unwrap();

        outbox
            .create_execution(&ProgramId::new("p"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(transport.calls().is_empty());
        assert_eq!(outbox.last_run().unwrap().exit, ExitReason::Busy);
        assert_eq!(outbox.spool().count(Stage::Pending).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_call_lifecycle() {
        let transport = ScriptedTransport::new();
        let (_dir, outbox) = outbox_with(transport.clone());

        let id = outbox
            .stage_remote_call(CorrelationId::new("peer-9"), json!({ "method": "sync" }))
            .await
            .unwrap();
        while outbox.spool().count(Stage::AwaitingResponse).unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        outbox.shutdown().await;

        assert_eq!(transport.calls()[0].subject, "Remote Calls");
        assert_eq!(outbox.spool().count(Stage::Staged).unwrap(), 0);

        let done = outbox.complete_remote_call(&id).unwrap();
        assert_eq!(done.stage, Stage::Done);
        assert!(matches!(
            outbox.complete_remote_call(&id),
            Err(OutboxError::NotAwaitingResponse(_))
        ));

        assert_eq!(outbox.prune_done(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(outbox.spool().count(Stage::Done).unwrap(), 1);
    }

    #[tokio::test]
    async fn oversize_entry_is_refused_at_enqueue() {
        let (_dir, outbox) = outbox_with(ScriptedTransport::new());

        let huge = "x".repeat(80 * 1024);
        let result = outbox
            .enqueue(Entry::execution(json!({ "blob": huge })))
            .await;

        assert!(matches!(result, Err(OutboxError::EntryTooLarge { .. })));
        assert_eq!(outbox.spool().count(Stage::Pending).unwrap(), 0);
        assert!(!outbox.is_dispatcher_running().await);
    }

    #[tokio::test]
    async fn malformed_entry_is_refused() {
        let (_dir, outbox) = outbox_with(ScriptedTransport::new());

        let mut entry = Entry::remote_call(CorrelationId::new("peer"), json!({}));
        entry.correlation_id = None;

        assert!(matches!(
            outbox.enqueue(entry).await,
            Err(OutboxError::MalformedEntry(_))
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_refused_at_open() {
        let dir = tempdir().unwrap();
        let config = DispatcherConfig {
            max_batch_entries: 0,
            ..DispatcherConfig::new()
        };
        let result = Outbox::open(dir.path(), ScriptedTransport::new(), config);
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }
}
