//! Mail delivery through a local MTA pickup directory.
//!
//! Each batch becomes one RFC 5322 message file written atomically into the
//! pickup directory. The local mail system (sendmail/postfix pickup, a
//! smarthost relay agent, ...) owns onward delivery, retries and
//! credentials, so this process never holds an SMTP password.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::config::TransportSettings;
use crate::persistence::fsync::write_atomic;

use super::error::{Result, TransportError};
use super::{MAX_PAYLOAD_BYTES, Transport};

/// Writes each batch as a `.eml` file into a pickup directory.
#[derive(Debug, Clone)]
pub struct PickupDirTransport {
    pickup_dir: PathBuf,
    sender: String,
    destination: String,
    max_payload: usize,
}

impl PickupDirTransport {
    pub fn new(
        pickup_dir: impl Into<PathBuf>,
        sender: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        PickupDirTransport {
            pickup_dir: pickup_dir.into(),
            sender: sender.into(),
            destination: destination.into(),
            max_payload: MAX_PAYLOAD_BYTES,
        }
    }

    /// Builds a transport from validated settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self::new(
            &settings.pickup_dir,
            &settings.sender,
            &settings.destination,
        )
    }

    pub fn pickup_dir(&self) -> &Path {
        &self.pickup_dir
    }

    /// Renders the complete message: headers, blank line, body.
    fn render(&self, message_id: &Uuid, subject: &str, payload: &[u8]) -> Vec<u8> {
        let domain = self
            .sender
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("localhost");

        let headers = format!(
            "From: {from}\r\n\
             To: {to}\r\n\
             Subject: {subject}\r\n\
             Date: {date}\r\n\
             Message-ID: <{id}@{domain}>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: application/json; charset=utf-8\r\n\
             Content-Transfer-Encoding: 8bit\r\n\
             \r\n",
            from = self.sender,
            to = self.destination,
            subject = subject.replace(['\r', '\n'], " "),
            date = Utc::now().to_rfc2822(),
            id = message_id.simple(),
        );

        let mut message = headers.into_bytes();
        message.extend_from_slice(payload);
        message.extend_from_slice(b"\r\n");
        message
    }
}

impl Transport for PickupDirTransport {
    async fn send(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        std::fs::create_dir_all(&self.pickup_dir)?;

        let message_id = Uuid::new_v4();
        let message = self.render(&message_id, subject, payload);
        let path = self.pickup_dir.join(format!("{}.eml", message_id.simple()));
        write_atomic(&path, &message)?;

        debug!(
            path = %path.display(),
            subject,
            bytes = payload.len(),
            "Message handed to pickup directory"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn transport(dir: &Path) -> PickupDirTransport {
        PickupDirTransport::new(dir, "outbox@example.com", "ops@example.org")
    }

    fn messages(dir: &Path) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "eml"))
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn send_writes_one_message_with_headers_and_body() {
        let dir = tempdir().unwrap();
        let t = transport(dir.path());

        t.send("Batched Executions", br#"[{"id":"a"}]"#).await.unwrap();

        let msgs = messages(dir.path());
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert!(msg.starts_with("From: outbox@example.com\r\n"));
        assert!(msg.contains("To: ops@example.org\r\n"));
        assert!(msg.contains("Subject: Batched Executions\r\n"));
        assert!(msg.contains("Message-ID: <"));
        assert!(msg.contains("@example.com>\r\n"));
        assert!(msg.contains("\r\n\r\n[{\"id\":\"a\"}]\r\n"));
    }

    #[tokio::test]
    async fn each_send_is_a_separate_message() {
        let dir = tempdir().unwrap();
        let t = transport(dir.path());

        t.send("Remote Calls", b"[]").await.unwrap();
        t.send("Remote Calls", b"[]").await.unwrap();

        assert_eq!(messages(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn oversize_payload_is_refused_without_writing() {
        let dir = tempdir().unwrap();
        let t = transport(dir.path());

        let payload = vec![b'x'; MAX_PAYLOAD_BYTES + 1];
        let err = t.send("Batched Executions", &payload).await.unwrap_err();

        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
        assert!(messages(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn subject_line_breaks_cannot_inject_headers() {
        let dir = tempdir().unwrap();
        let t = transport(dir.path());

        t.send("hi\r\nBcc: someone@evil.test", b"[]").await.unwrap();

        let msg = &messages(dir.path())[0];
        assert!(msg.contains("Subject: hi  Bcc: someone@evil.test\r\n"));
        assert!(!msg.contains("\r\nBcc:"));
    }

    #[tokio::test]
    async fn unusable_pickup_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let t = transport(&blocker.join("pickup"));
        assert!(t.send("Remote Calls", b"[]").await.is_err());
    }
}
