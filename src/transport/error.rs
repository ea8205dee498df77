//! Transport error types.
//!
//! Every transport failure is treated as transient by the dispatcher: the
//! batch stays in the spool and is retried after backoff. The variants exist
//! for logging and for callers that want to tell an operator what went wrong.

use std::io;

use thiserror::Error;

/// Errors a transport can report for one `send`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The payload exceeds what this transport will carry.
    #[error("payload of {size} bytes exceeds transport limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The remote end, or the local handoff, refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The transport could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// IO error while handing the message off.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
