//! Delivery of batch payloads to the outside world.
//!
//! The dispatcher is generic over [`Transport`] so delivery can be swapped out
//! in tests (recording doubles) and in deployments (local pickup directory,
//! or anything else that can carry a subject and an opaque body).

pub mod error;
pub mod pickup;

pub use error::{Result, TransportError};
pub use pickup::PickupDirTransport;

/// Largest payload the bundled transports accept, in bytes.
///
/// The default batch ceiling matches it, so a batch built under default
/// settings always fits.
pub const MAX_PAYLOAD_BYTES: usize = 72 * 1024;

/// Hands one batch payload to an external delivery mechanism.
///
/// `send` either delivers the whole payload (`Ok`) or nothing the caller can
/// rely on (`Err`). A future dropped before completion (cancellation) counts
/// as a failure: the dispatcher leaves the batch's entries in the spool.
///
/// # Example (mock for testing)
///
/// ```ignore
/// struct CountingTransport {
///     sent: AtomicUsize,
/// }
///
/// impl Transport for CountingTransport {
///     async fn send(&self, _subject: &str, _payload: &[u8]) -> Result<(), TransportError> {
///         self.sent.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// }
/// ```
pub trait Transport {
    /// Deliver `payload` under `subject`.
    fn send(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;
}
