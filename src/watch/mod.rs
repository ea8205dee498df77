//! Early wake-ups for an idle dispatcher.
//!
//! A sleeping dispatcher waits on a [`WakeSignal`]; anything that knows new
//! work exists calls [`WakeSignal::wake`]. The signal is purely an
//! optimization: a dispatcher whose signal never fires still drains the spool
//! on its next backoff tick.
//!
//! Two sources fire the signal:
//! - The producer API, right after it spools an entry.
//! - [`spawn_stage_watcher`], which polls stage directories for changes made
//!   by producers in other processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::spool::Spool;
use crate::types::{EntryId, Stage};

/// A clonable, level-triggered wake-up.
///
/// A `wake()` with nobody waiting is remembered, so the next `notified()`
/// returns at once. Multiple wakes before a wait collapse into one.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the waiting dispatcher, or the next one to wait.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Completes on the next (or a pending) wake.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// The set of entry IDs last seen in the watched stages.
fn snapshot(spool: &Spool, stages: &[Stage]) -> Vec<EntryId> {
    let mut ids = Vec::new();
    for stage in stages {
        match spool.list(*stage) {
            Ok(refs) => ids.extend(refs.into_iter().map(|r| r.id)),
            Err(e) => warn!(stage = %stage, error = %e, "Stage watcher failed to list"),
        }
    }
    ids.sort();
    ids
}

/// Spawns a task that wakes `signal` whenever an entry appears in one of
/// `stages` that was not there on the previous poll.
///
/// Removals do not wake. The task exits when `cancel` is triggered.
pub fn spawn_stage_watcher(
    spool: Spool,
    stages: Vec<Stage>,
    signal: WakeSignal,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(?stages, ?interval, "Stage watcher started");
        let mut seen = snapshot(&spool, &stages);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stage watcher stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let current = snapshot(&spool, &stages);
            let appeared = current
                .iter()
                .filter(|id| seen.binary_search(id).is_err())
                .count();
            if appeared > 0 {
                trace!(appeared, "New entries observed, waking dispatcher");
                signal.wake();
            }
            seen = current;
        }
    })
}
