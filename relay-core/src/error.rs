//! Domain-specific error types for the relay control channel.
//!
//! All fallible operations return `Result<T, RelayError>`.
//! Failures are recovered at the component boundary (one session, one
//! reconnection attempt); none of them is meant to take the process down.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// An inbound frame could not be decoded into an [`Envelope`].
    ///
    /// [`Envelope`]: crate::protocol::Envelope
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// A chunk, completion or error referenced a transfer id with no session.
    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    /// The peer sent a filename that cannot be stored safely.
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    /// Completion arrived with a byte count different from the announced size.
    #[error("transfer {id} size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch {
        id: String,
        expected: u64,
        received: u64,
    },

    /// Another open session is already writing to this destination.
    #[error("{path} is already being received by transfer {owner}")]
    DestinationBusy { path: String, owner: String },

    /// A `request_file` named something this side does not serve.
    #[error("file request for {path:?} refused: {reason}")]
    RequestRefused { path: String, reason: &'static str },

    /// A transfer sat without traffic for longer than the idle timeout.
    #[error("transfer {id} idle for {idle:?}")]
    TransferIdle { id: String, idle: Duration },

    /// A link state transition was attempted from the wrong phase.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Size Limits ──────────────────────────────────────────────
    /// A payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Transport Errors ─────────────────────────────────────────
    /// The filesystem or socket layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The reconnection loop gave up.
    #[error("reconnection failed after {0} attempts")]
    ReconnectExhausted(u32),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding of an outbound payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Clipboard Errors ─────────────────────────────────────────
    /// The clipboard backend could not be opened, read or written.
    #[error("clipboard error: {0}")]
    Clipboard(String),

    /// Image data could not be decoded or re-encoded.
    #[error("image error: {0}")]
    Image(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// The message sent to the peer inside a `file_transfer_error` envelope.
    pub fn peer_message(&self) -> String {
        match self {
            RelayError::TransferNotFound(_) => "transfer not found".to_string(),
            other => other.to_string(),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::ChannelClosed
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Malformed(e.to_string())
    }
}

impl From<image::ImageError> for RelayError {
    fn from(e: image::ImageError) -> Self {
        RelayError::Image(e.to_string())
    }
}
