//! The dispatcher control loop.
//!
//! ```text
//! Acquiring ──busy──► Exited
//!     │
//!     ▼
//! Draining ──batch──► Sending ──ok──► Draining
//!     │                  │
//!     │ empty            │ failed
//!     ▼                  ▼
//! Idle-check ◄──────── Backoff
//!     │      └──sleep──► Draining
//!     ▼
//! Exited
//! ```
//!
//! # Delivery Order
//!
//! After the transport accepts a batch, each entry's `Sent` outcome is written
//! to the ledger *before* the entry is removed (or advanced) in the spool. A
//! crash between the two leaves an entry the ledger already knows about; the
//! next drain settles it without sending it again.
//!
//! # Cancellation
//!
//! Cancellation is observed while waiting for the lock, while sleeping, and
//! while the transport is sending. Applying a delivered batch has no await
//! points, so a batch is either fully applied or left entirely pending.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ConfigError;
use crate::ledger::{Ledger, LedgerError, LedgerOutcome};
use crate::lock::{ExclusionLock, LockError, LockOutcome};
use crate::spool::{EntryRef, Spool, SpoolError};
use crate::transport::Transport;
use crate::types::{EntryId, EntryKind, Stage};
use crate::watch::{WakeSignal, spawn_stage_watcher};

use super::backoff::Backoff;
use super::batch::{Batch, BatchBuilder, Push};
use super::config::DispatcherConfig;

/// Name of the ledger file under the spool root.
pub const LEDGER_FILE_NAME: &str = "ledger.jsonl";

/// Kinds in the order their stages are drained.
const DRAIN_ORDER: [EntryKind; 2] = [EntryKind::Execution, EntryKind::RemoteCall];

/// Errors that stop a dispatcher run.
///
/// Storage errors inside a drain cycle do not end the run; they abort that
/// cycle and are retried after backoff.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Why a dispatcher run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitReason {
    /// Another dispatcher holds the lock; this one never started.
    Busy,
    /// Nothing was delivered for the idle timeout.
    #[default]
    Idle,
    /// The cancellation token fired.
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Busy => write!(f, "busy"),
            ExitReason::Idle => write!(f, "idle"),
            ExitReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What one dispatcher run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches_sent: usize,
    pub entries_sent: usize,
    /// Entries found already delivered in the ledger and settled without a send.
    pub entries_recovered: usize,
    pub entries_rejected: usize,
    pub send_failures: usize,
    /// The run went idle while the transport was still refusing a backlog.
    pub left_pending: bool,
    pub exit: ExitReason,
}

impl RunSummary {
    fn exited(exit: ExitReason) -> Self {
        RunSummary {
            exit,
            ..Default::default()
        }
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Something was delivered, recovered, or rejected; drain again now.
    Progress,
    /// Nothing dispatchable was found.
    Empty,
    /// The transport refused a batch.
    SendFailed,
    /// Cancelled while the transport was sending.
    Cancelled,
}

/// Drains one spool through one transport.
#[derive(Debug)]
pub struct Dispatcher<T> {
    spool: Spool,
    transport: T,
    config: DispatcherConfig,
    wake: WakeSignal,
    #[cfg(test)]
    ledger_faults: crate::ledger::WriteFaults,
}

impl<T: Transport + Sync> Dispatcher<T> {
    pub fn new(spool: Spool, transport: T, config: DispatcherConfig) -> Self {
        Dispatcher {
            spool,
            transport,
            config,
            wake: WakeSignal::new(),
            #[cfg(test)]
            ledger_faults: Default::default(),
        }
    }

    /// Uses `wake` to cut idle sleeps short, sharing it with producers.
    pub fn with_wake_signal(mut self, wake: WakeSignal) -> Self {
        self.wake = wake;
        self
    }

    pub fn wake_signal(&self) -> &WakeSignal {
        &self.wake
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Path of the ledger this dispatcher writes.
    pub fn ledger_path(&self) -> PathBuf {
        self.spool.root().join(LEDGER_FILE_NAME)
    }

    #[cfg(test)]
    pub(crate) fn ledger_faults(&self) -> &crate::ledger::WriteFaults {
        &self.ledger_faults
    }

    fn open_ledger(&self) -> Result<Ledger> {
        let ledger = Ledger::open(self.ledger_path())?;
        #[cfg(test)]
        let ledger = ledger.with_faults(self.ledger_faults.clone());
        Ok(ledger)
    }

    /// Runs until idle, cancelled, or another dispatcher is found active.
    ///
    /// The exclusion lock is released before this returns, on every path.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, a lock file that cannot be
    /// opened, or a ledger that cannot be opened. Errors during draining are
    /// logged and retried, not returned.
    #[instrument(skip_all, fields(root = %self.spool.root().display()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.config.validate()?;

        let lock = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancelled while waiting for the exclusion lock");
                return Ok(RunSummary::exited(ExitReason::Cancelled));
            }
            outcome = ExclusionLock::try_acquire(self.spool.root(), self.config.lock_timeout) => {
                match outcome? {
                    LockOutcome::Acquired(lock) => lock,
                    LockOutcome::Busy => {
                        info!("Another dispatcher is active, not starting");
                        return Ok(RunSummary::exited(ExitReason::Busy));
                    }
                }
            }
        };

        info!(pid = lock.holder().pid, "Dispatcher started");
        let result = self.run_locked(&cancel).await;
        lock.release();

        match &result {
            Ok(summary) => info!(
                exit = %summary.exit,
                batches_sent = summary.batches_sent,
                entries_sent = summary.entries_sent,
                entries_recovered = summary.entries_recovered,
                entries_rejected = summary.entries_rejected,
                send_failures = summary.send_failures,
                "Dispatcher stopped"
            ),
            Err(e) => error!(error = %e, "Dispatcher failed"),
        }
        result
    }

    async fn run_locked(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let removed = self
            .spool
            .cleanup_orphaned_temp_files(self.config.orphan_temp_age)?;
        if removed > 0 {
            info!(removed, "Removed temp files left by interrupted writers");
        }

        let mut ledger = self.open_ledger()?;
        debug!(next_seq = ledger.next_seq(), "Ledger replayed");

        let watcher_cancel = cancel.child_token();
        let _watcher_guard = watcher_cancel.clone().drop_guard();
        if let Some(interval) = self.config.watch_interval {
            spawn_stage_watcher(
                self.spool.clone(),
                Stage::DISPATCHABLE.to_vec(),
                self.wake.clone(),
                interval,
                watcher_cancel,
            );
        }

        let mut summary = RunSummary::default();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut last_activity = Instant::now();

        loop {
            if cancel.is_cancelled() {
                summary.exit = ExitReason::Cancelled;
                break;
            }

            let cycle = match self.drain_once(&mut ledger, &mut summary, cancel).await {
                Ok(cycle) => cycle,
                Err(e) => {
                    warn!(error = %e, "Drain cycle aborted by storage error");
                    if ledger.is_poisoned() {
                        match self.open_ledger() {
                            Ok(reopened) => {
                                info!("Ledger reopened after a failed rollback");
                                ledger = reopened;
                            }
                            Err(e) => warn!(error = %e, "Could not reopen ledger"),
                        }
                    }
                    Cycle::SendFailed
                }
            };

            let wait = match cycle {
                Cycle::Progress => {
                    backoff.reset();
                    last_activity = Instant::now();
                    continue;
                }
                Cycle::Cancelled => {
                    summary.exit = ExitReason::Cancelled;
                    break;
                }
                Cycle::Empty => backoff.current(),
                Cycle::SendFailed => {
                    let wait = backoff.on_failure();
                    debug!(
                        wait_secs = wait.as_secs_f64(),
                        next_wait_secs = backoff.current().as_secs_f64(),
                        "Backing off"
                    );
                    wait
                }
            };

            let idle_for = last_activity.elapsed();
            if idle_for >= self.config.idle_timeout {
                summary.left_pending = cycle != Cycle::Empty;
                if summary.left_pending {
                    warn!(
                        idle_secs = idle_for.as_secs(),
                        "Idle timeout reached with entries still pending"
                    );
                } else {
                    info!(idle_secs = idle_for.as_secs(), "Idle timeout reached");
                }
                summary.exit = ExitReason::Idle;
                break;
            }

            // A wake only shortens idle polling; it never cuts a failure backoff short.
            let wakeable = cycle == Cycle::Empty;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled while sleeping");
                    summary.exit = ExitReason::Cancelled;
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified(), if wakeable => {
                    trace!("Woken early by new entries");
                }
            }
        }

        Ok(summary)
    }

    /// Drains at most one batch.
    ///
    /// Stages are visited in [`DRAIN_ORDER`]. Entries the ledger already holds
    /// as delivered are settled in passing; undecodable or oversize entries are
    /// rejected. The first stage that yields a batch is sent.
    async fn drain_once(
        &self,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<Cycle> {
        let mut progressed = false;

        for kind in DRAIN_ORDER {
            let stage = kind.initial_stage();
            let mut builder = BatchBuilder::new(
                kind,
                self.config.max_batch_entries,
                self.config.max_batch_bytes,
            );

            for entry_ref in self.spool.list(stage)? {
                if ledger.was_delivered(&entry_ref.id) {
                    if self.settle_delivered(&entry_ref, kind)? {
                        info!(entry_id = %entry_ref.id, "Settled entry already delivered before restart");
                        summary.entries_recovered += 1;
                        progressed = true;
                    }
                    continue;
                }

                if builder.is_full() {
                    break;
                }

                let entry = match self.spool.read(&entry_ref) {
                    Ok(entry) => entry,
                    Err(e) if e.is_not_found() => {
                        debug!(entry_id = %entry_ref.id, "Entry vanished before read, skipping");
                        continue;
                    }
                    Err(SpoolError::Corrupt { reason, .. }) => {
                        if self.reject(ledger, &entry_ref, &reason)? {
                            summary.entries_rejected += 1;
                            progressed = true;
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                if entry.kind != kind {
                    let reason = format!("{} entry found in {} stage", entry.kind, stage);
                    if self.reject(ledger, &entry_ref, &reason)? {
                        summary.entries_rejected += 1;
                        progressed = true;
                    }
                    continue;
                }

                let serialized = serde_json::to_vec(&entry).map_err(SpoolError::from)?;
                match builder.push(entry_ref.clone(), &serialized) {
                    Push::Added => {}
                    Push::Full => break,
                    Push::Oversize => {
                        let reason = format!(
                            "{} bytes exceeds the batch ceiling of {} bytes",
                            serialized.len(),
                            self.config.max_batch_bytes
                        );
                        if self.reject(ledger, &entry_ref, &reason)? {
                            summary.entries_rejected += 1;
                            progressed = true;
                        }
                    }
                }
            }

            if let Some(batch) = builder.finish() {
                return self.deliver(batch, ledger, summary, cancel).await;
            }
        }

        Ok(if progressed { Cycle::Progress } else { Cycle::Empty })
    }

    /// Sends one batch and, on success, settles every entry in it.
    async fn deliver(
        &self,
        batch: Batch,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<Cycle> {
        let batch_len = batch.len();
        let batch_bytes = batch.body().len();
        debug!(
            kind = %batch.kind(),
            batch_len,
            batch_bytes,
            "Sending batch"
        );

        let sent = tokio::select! {
            // A send that has completed must be applied, so check it first.
            biased;
            result = self.transport.send(batch.subject(), batch.body()) => result,
            _ = cancel.cancelled() => {
                info!(batch_len, "Cancelled during send; batch left pending");
                return Ok(Cycle::Cancelled);
            }
        };

        if let Err(e) = sent {
            summary.send_failures += 1;
            warn!(
                error = %e,
                kind = %batch.kind(),
                batch_len,
                batch_bytes,
                "Batch send failed; entries stay pending"
            );
            return Ok(Cycle::SendFailed);
        }

        let now = Utc::now();
        for entry_ref in batch.entries() {
            self.record_outcome(ledger, &entry_ref.id, LedgerOutcome::Sent, now)?;
            self.settle_delivered(entry_ref, batch.kind())?;
            summary.entries_sent += 1;
        }
        summary.batches_sent += 1;

        info!(
            kind = %batch.kind(),
            batch_len,
            batch_bytes,
            "Batch delivered"
        );
        Ok(Cycle::Progress)
    }

    /// Applies the post-send transition for `kind`: remove, or advance.
    ///
    /// Returns false if the entry was already gone.
    fn settle_delivered(&self, entry_ref: &EntryRef, kind: EntryKind) -> Result<bool> {
        let settled = match kind.stage_after_send() {
            None => self.spool.remove(entry_ref),
            Some(next) => self.spool.move_to(entry_ref, next).map(|_| ()),
        };
        match settled {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(entry_id = %entry_ref.id, "Entry already settled");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records `Failed` and moves the entry to the rejected stage.
    ///
    /// Returns false if the entry was already gone.
    fn reject(&self, ledger: &mut Ledger, entry_ref: &EntryRef, reason: &str) -> Result<bool> {
        warn!(entry_id = %entry_ref.id, stage = %entry_ref.stage, reason, "Rejecting entry");
        self.record_outcome(ledger, &entry_ref.id, LedgerOutcome::Failed, Utc::now())?;
        match self.spool.move_to(entry_ref, Stage::Rejected) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes one ledger record, retrying before giving up on the cycle.
    fn record_outcome(
        &self,
        ledger: &mut Ledger,
        id: &EntryId,
        outcome: LedgerOutcome,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match ledger.record(id, outcome, ts) {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.config.ledger_attempts => {
                    warn!(entry_id = %id, attempt, error = %e, "Ledger write failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    error!(entry_id = %id, attempt, error = %e, "Ledger write failed");
                    return Err(e.into());
                }
            }
        }
    }
}
