//! One in-progress inbound file transfer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::error::RelayError;
use crate::protocol::file::percent;

/// Lifecycle of a [`TransferSession`].
///
/// ```text
///  Created ──► Receiving ──► Completed
///     │            │
///     └────────────┴───────► Failed
/// ```
///
/// Terminal states never stay in the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Receiving,
    Completed,
    Failed,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Receiving => write!(f, "Receiving"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Receiving-side state of one transfer, keyed by its id.
#[derive(Debug)]
pub struct TransferSession {
    id: String,
    filename: String,
    path: PathBuf,
    expected_size: u64,
    bytes_received: u64,
    /// `None` once the handle has been closed.
    file: Option<File>,
    state: TransferState,
    last_activity: Instant,
    /// Highest 10% threshold already reported.
    last_decile: u8,
}

impl TransferSession {
    /// Create the destination file and a fresh session for it.
    pub async fn create(
        id: impl Into<String>,
        filename: impl Into<String>,
        path: PathBuf,
        expected_size: u64,
    ) -> Result<Self, RelayError> {
        let file = File::create(&path).await?;
        Ok(Self {
            id: id.into(),
            filename: filename.into(),
            path,
            expected_size,
            bytes_received: 0,
            file: Some(file),
            state: TransferState::Created,
            last_activity: Instant::now(),
            last_decile: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Time since the session last saw traffic.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Append one chunk.
    ///
    /// Returns the new percentage when this chunk crossed a 10% threshold
    /// that had not been reported yet.
    pub async fn append(&mut self, data: &[u8]) -> Result<Option<u8>, RelayError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RelayError::Other(format!("transfer {} is closed", self.id)))?;
        file.write_all(data).await?;

        self.state = TransferState::Receiving;
        self.bytes_received += data.len() as u64;
        self.last_activity = Instant::now();

        if self.expected_size == 0 {
            return Ok(None);
        }
        let pct = percent(self.bytes_received, self.expected_size);
        let decile = pct / 10;
        if decile > self.last_decile {
            self.last_decile = decile;
            Ok(Some(decile * 10))
        } else {
            Ok(None)
        }
    }

    /// Flush and close the file, marking the transfer complete.
    pub async fn finish(&mut self) -> Result<(), RelayError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.state = TransferState::Completed;
        Ok(())
    }

    /// Close the file and remove what was written so far.
    pub async fn discard(&mut self) {
        self.state = TransferState::Failed;
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                tracing::debug!(path = %self.path.display(), "could not remove partial file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_each_decile_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TransferSession::create("t", "f.bin", dir.path().join("f.bin"), 100)
            .await
            .unwrap();
        assert_eq!(session.state(), TransferState::Created);

        assert_eq!(session.append(&[0; 5]).await.unwrap(), None);
        assert_eq!(session.append(&[0; 5]).await.unwrap(), Some(10));
        assert_eq!(session.append(&[0; 1]).await.unwrap(), None);
        // jumping several thresholds reports the highest
        assert_eq!(session.append(&[0; 40]).await.unwrap(), Some(50));
        assert_eq!(session.state(), TransferState::Receiving);
        assert_eq!(session.bytes_received(), 51);
    }

    #[tokio::test]
    async fn finish_persists_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut session = TransferSession::create("t", "out.txt", path.clone(), 5)
            .await
            .unwrap();
        session.append(b"hello").await.unwrap();
        session.finish().await.unwrap();
        assert_eq!(session.state(), TransferState::Completed);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn discard_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        let mut session = TransferSession::create("t", "partial", path.clone(), 10)
            .await
            .unwrap();
        session.append(b"abc").await.unwrap();
        session.discard().await;
        assert_eq!(session.state(), TransferState::Failed);
        assert!(!path.exists());
        assert!(session.append(b"more").await.is_err());
    }
}
