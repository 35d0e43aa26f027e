//! Chunked file transfer over the control channel.
//!
//! | Module    | Purpose                                          |
//! |-----------|--------------------------------------------------|
//! | `session` | One inbound transfer: file handle and counters   |
//! | `engine`  | Session table, sending side, idle sweeping       |

pub mod engine;
pub mod session;

use std::path::PathBuf;
use std::time::Duration;

pub use engine::TransferEngine;
pub use session::{TransferSession, TransferState};

use crate::protocol::DEFAULT_CHUNK_SIZE;

/// Knobs for a [`TransferEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Root that peer `request_file` paths resolve against; `None` refuses them.
    pub share_dir: Option<PathBuf>,
    /// Payload bytes per outgoing `file_chunk`.
    pub chunk_size: usize,
    /// Sessions without traffic for this long are failed by the sweeper.
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    /// Fail completions whose byte count differs from the announced size.
    pub verify_size: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            share_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: Some(Duration::from_secs(120)),
            sweep_interval: Duration::from_secs(10),
            verify_size: true,
        }
    }
}

/// Observable progress of inbound and outbound transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// An inbound session was opened.
    Started {
        id: String,
        filename: String,
        size: u64,
    },
    /// An inbound session crossed a 10% threshold.
    Progress {
        id: String,
        percent: u8,
        bytes_received: u64,
        expected_size: u64,
    },
    /// An inbound file was written completely and acknowledged.
    Completed {
        id: String,
        path: PathBuf,
        bytes: u64,
    },
    /// A session (either direction) was aborted.
    Failed { id: String, error: String },
    /// The peer acknowledged one of our uploads.
    Acknowledged { id: String },
    /// All envelopes for an upload were handed to the transport.
    Sent { id: String, bytes: u64, chunks: u64 },
}
