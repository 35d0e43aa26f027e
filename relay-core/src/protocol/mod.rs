//! Envelope definitions for everything that crosses the control channel.
//!
//! Each frame on the transport carries exactly one JSON object with a
//! `type` discriminator. Frames are decoded once, at the transport
//! boundary, into the closed [`Envelope`] enum; nothing downstream looks
//! at raw JSON.
//!
//! ```text
//! type                     direction                       fields
//! file_transfer_start      sender → receiver               id, filename, size
//! file_chunk               sender → receiver               id, offset, data (base64)
//! file_transfer_complete   sender → receiver, echoed back  id
//! file_transfer_error      either direction                id, error
//! request_file             requester → file owner          path
//! clipboard_text           either direction                content
//! clipboard_image          either direction                content (base64 PNG)
//! ```

pub mod file;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

pub use file::{DEFAULT_CHUNK_SIZE, compute_total_chunks};

/// One discriminated message unit exchanged over the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Opens a new transfer session on the receiving side.
    FileTransferStart {
        id: String,
        filename: String,
        size: u64,
    },

    /// Appends `data` to the session. `offset` is informational only.
    #[serde(alias = "file_transfer_chunk")]
    FileChunk {
        id: String,
        #[serde(default)]
        offset: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Finalizes a transfer; the receiver echoes it back as the acknowledgment.
    FileTransferComplete { id: String },

    /// Aborts a transfer session on either side.
    FileTransferError { id: String, error: String },

    /// Asks the peer to upload a file from its shared directory.
    RequestFile { path: String },

    /// Remote clipboard text.
    ClipboardText { content: String },

    /// Remote clipboard image, PNG-normalized by the sender.
    ClipboardImage {
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
}

impl Envelope {
    /// Decode a frame received from the transport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self).map_err(|e| RelayError::Encoding(e.to_string()))
    }

    /// The wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::FileTransferStart { .. } => "file_transfer_start",
            Envelope::FileChunk { .. } => "file_chunk",
            Envelope::FileTransferComplete { .. } => "file_transfer_complete",
            Envelope::FileTransferError { .. } => "file_transfer_error",
            Envelope::RequestFile { .. } => "request_file",
            Envelope::ClipboardText { .. } => "clipboard_text",
            Envelope::ClipboardImage { .. } => "clipboard_image",
        }
    }

    /// The transfer id for the four envelopes that carry one.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Envelope::FileTransferStart { id, .. }
            | Envelope::FileChunk { id, .. }
            | Envelope::FileTransferComplete { id }
            | Envelope::FileTransferError { id, .. } => Some(id),
            Envelope::RequestFile { .. }
            | Envelope::ClipboardText { .. }
            | Envelope::ClipboardImage { .. } => None,
        }
    }

    /// Convenience constructor for the error envelope.
    pub fn transfer_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Envelope::FileTransferError {
            id: id.into(),
            error: error.into(),
        }
    }
}

/// Binary payloads travel as standard base64 strings.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]> + ?Sized,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────
