//! Dispatcher tunables.
//!
//! # Defaults
//!
//! - **Idle timeout**: 120 seconds without a delivery before the dispatcher
//!   exits (`MAIL_OUTBOX_IDLE_TIMEOUT_SECS`)
//! - **Backoff**: 10 seconds, doubling per consecutive failure up to 120
//!   seconds (`MAIL_OUTBOX_INITIAL_BACKOFF_SECS`, `MAIL_OUTBOX_MAX_BACKOFF_SECS`)
//! - **Batch ceiling**: 2000 entries and 72 KiB of body per batch
//!   (`MAIL_OUTBOX_MAX_BATCH_ENTRIES`, `MAIL_OUTBOX_MAX_BATCH_BYTES`)
//! - **Lock wait**: 1 second before concluding another dispatcher is active
//!   (`MAIL_OUTBOX_LOCK_TIMEOUT_MS`)
//! - **Watch interval**: stage directories are polled for new entries every
//!   second (`MAIL_OUTBOX_WATCH_INTERVAL_MS`, `0` disables the watcher)

use std::time::Duration;

use crate::config::{ConfigError, Result, parsed_var, process_env};
use crate::transport::MAX_PAYLOAD_BYTES;

use super::batch::EMPTY_BATCH_BYTES;

/// Default idle timeout (2 minutes).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// Default first backoff wait (10 seconds).
const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 10;

/// Default backoff ceiling (2 minutes).
const DEFAULT_MAX_BACKOFF_SECS: u64 = 120;

/// Default maximum entries per batch.
const DEFAULT_MAX_BATCH_ENTRIES: usize = 2000;

/// Default lock acquisition wait (1 second).
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

/// Default stage watcher poll interval (1 second).
const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

/// Temp files younger than this may belong to a live producer.
const DEFAULT_ORPHAN_TEMP_AGE_SECS: u64 = 60;

/// Attempts at writing one ledger record before the cycle is aborted.
const DEFAULT_LEDGER_ATTEMPTS: u32 = 3;

/// Configuration for one dispatcher instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Exit after this long without a successful delivery.
    pub idle_timeout: Duration,

    /// Backoff floor: the first wait after a failure, and the poll interval
    /// while idle.
    pub initial_backoff: Duration,

    /// Backoff ceiling.
    pub max_backoff: Duration,

    /// Maximum entries in one batch.
    pub max_batch_entries: usize,

    /// Maximum byte length of one batch body.
    pub max_batch_bytes: usize,

    /// How long to wait for the exclusion lock before giving up.
    pub lock_timeout: Duration,

    /// Poll interval of the stage watcher. `None` disables it.
    pub watch_interval: Option<Duration>,

    /// Minimum age of a temp file before startup cleanup removes it.
    pub orphan_temp_age: Duration,

    /// Attempts at writing one ledger record before giving up on the cycle.
    pub ledger_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfig {
    /// Creates a `DispatcherConfig` with default values.
    pub fn new() -> Self {
        DispatcherConfig {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            initial_backoff: Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            max_batch_entries: DEFAULT_MAX_BATCH_ENTRIES,
            max_batch_bytes: MAX_PAYLOAD_BYTES,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            watch_interval: Some(Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS)),
            orphan_temp_age: Duration::from_secs(DEFAULT_ORPHAN_TEMP_AGE_SECS),
            ledger_attempts: DEFAULT_LEDGER_ATTEMPTS,
        }
    }

    /// Creates a `DispatcherConfig` from environment variables.
    ///
    /// Unset variables use defaults. The result is validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&process_env)
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::new();

        let watch_ms = parsed_var(
            lookup,
            "MAIL_OUTBOX_WATCH_INTERVAL_MS",
            DEFAULT_WATCH_INTERVAL_MS,
        )?;

        let config = DispatcherConfig {
            idle_timeout: Duration::from_secs(parsed_var(
                lookup,
                "MAIL_OUTBOX_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?),
            initial_backoff: Duration::from_secs(parsed_var(
                lookup,
                "MAIL_OUTBOX_INITIAL_BACKOFF_SECS",
                DEFAULT_INITIAL_BACKOFF_SECS,
            )?),
            max_backoff: Duration::from_secs(parsed_var(
                lookup,
                "MAIL_OUTBOX_MAX_BACKOFF_SECS",
                DEFAULT_MAX_BACKOFF_SECS,
            )?),
            max_batch_entries: parsed_var(
                lookup,
                "MAIL_OUTBOX_MAX_BATCH_ENTRIES",
                DEFAULT_MAX_BATCH_ENTRIES,
            )?,
            max_batch_bytes: parsed_var(
                lookup,
                "MAIL_OUTBOX_MAX_BATCH_BYTES",
                defaults.max_batch_bytes,
            )?,
            lock_timeout: Duration::from_millis(parsed_var(
                lookup,
                "MAIL_OUTBOX_LOCK_TIMEOUT_MS",
                DEFAULT_LOCK_TIMEOUT_MS,
            )?),
            watch_interval: (watch_ms > 0).then(|| Duration::from_millis(watch_ms)),
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::Invalid {
                var: "MAIL_OUTBOX_INITIAL_BACKOFF_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::Invalid {
                var: "MAIL_OUTBOX_MAX_BACKOFF_SECS",
                reason: format!(
                    "{:?} is below the initial backoff {:?}",
                    self.max_backoff, self.initial_backoff
                ),
            });
        }
        if self.max_batch_entries == 0 {
            return Err(ConfigError::Invalid {
                var: "MAIL_OUTBOX_MAX_BATCH_ENTRIES",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_batch_bytes <= EMPTY_BATCH_BYTES {
            return Err(ConfigError::Invalid {
                var: "MAIL_OUTBOX_MAX_BATCH_BYTES",
                reason: format!("must exceed {} bytes", EMPTY_BATCH_BYTES),
            });
        }
        if self.max_batch_bytes > MAX_PAYLOAD_BYTES {
            return Err(ConfigError::Invalid {
                var: "MAIL_OUTBOX_MAX_BATCH_BYTES",
                reason: format!(
                    "{} bytes exceeds the transport limit of {} bytes",
                    self.max_batch_bytes, MAX_PAYLOAD_BYTES
                ),
            });
        }
        if self.ledger_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "ledger_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
