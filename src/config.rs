//! Configuration loaded from the environment.
//!
//! All settings are plain values handed to the components that need them;
//! nothing reads the environment after startup.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `MAIL_OUTBOX_SPOOL_DIR` | spool root | `./outbox` |
//! | `MAIL_OUTBOX_SENDER` | `From` address | required |
//! | `MAIL_OUTBOX_DESTINATION` | `To` address | required |
//! | `MAIL_OUTBOX_PICKUP_DIR` | MTA pickup directory | required |
//!
//! Dispatcher tunables are documented on [`DispatcherConfig`].

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::dispatch::DispatcherConfig;

/// Default spool root, relative to the working directory.
pub const DEFAULT_SPOOL_DIR: &str = "./outbox";

/// Errors in startup configuration. Fatal: the dispatcher refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("missing required configuration: {var}")]
    Missing { var: &'static str },

    /// A variable is set but unusable.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Reads one variable through `lookup`, treating empty as unset.
pub(crate) fn optional_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn required_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String> {
    optional_var(lookup, var).ok_or(ConfigError::Missing { var })
}

/// Parses an optional variable, falling back to `default` when unset.
pub(crate) fn parsed_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(lookup, var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: format!("{:?}: {}", raw, e),
        }),
    }
}

/// The process environment as a lookup function.
pub(crate) fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Checks the `local@domain.tld` shape of an email address.
///
/// The local part allows `[A-Za-z0-9_.+-]`; the domain is a label of
/// `[A-Za-z0-9-]`, a dot, then `[A-Za-z0-9.-]`.
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };

    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-'));

    let domain_ok = match domain.split_once('.') {
        Some((label, rest)) => {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
        }
        None => false,
    };

    local_ok && domain_ok
}

/// Where and to whom batches are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub sender: String,
    pub destination: String,
    pub pickup_dir: PathBuf,
}

impl TransportSettings {
    /// Loads transport settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    /// Loads transport settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sender = required_var(&lookup, "MAIL_OUTBOX_SENDER")?;
        let destination = required_var(&lookup, "MAIL_OUTBOX_DESTINATION")?;
        let pickup_dir = required_var(&lookup, "MAIL_OUTBOX_PICKUP_DIR")?;

        for (var, address) in [
            ("MAIL_OUTBOX_SENDER", &sender),
            ("MAIL_OUTBOX_DESTINATION", &destination),
        ] {
            if !is_valid_email(address) {
                return Err(ConfigError::Invalid {
                    var,
                    reason: format!("{:?} is not an email address", address),
                });
            }
        }

        Ok(TransportSettings {
            sender,
            destination,
            pickup_dir: PathBuf::from(pickup_dir),
        })
    }
}

/// Everything a process needs to run the outbox.
#[derive(Debug, Clone)]
pub struct Settings {
    pub spool_dir: PathBuf,
    pub dispatcher: DispatcherConfig,
    pub transport: TransportSettings,
}

impl Settings {
    /// Loads all settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    /// Loads all settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Settings {
            spool_dir: spool_dir_from_lookup(&lookup),
            dispatcher: DispatcherConfig::from_lookup(&lookup)?,
            transport: TransportSettings::from_lookup(&lookup)?,
        })
    }
}

/// The spool root, which needs no transport settings to resolve.
pub fn spool_dir_from_env() -> PathBuf {
    spool_dir_from_lookup(&process_env)
}

fn spool_dir_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    optional_var(lookup, "MAIL_OUTBOX_SPOOL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR))
}
