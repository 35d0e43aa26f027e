//! # relay-core
//!
//! Control-channel core shared by the relay agent and controller.
//!
//! This crate contains:
//! - **Protocol**: the closed `Envelope` enum exchanged as JSON frames
//! - **Codec**: length-delimited framing for stream transports
//! - **Network**: the `Transport` contract and the reconnect-friendly `Link`
//! - **State**: `LinkPhase`, the controller's connection state machine
//! - **Reconnect**: `ReconnectionManager` with exponential backoff
//! - **Transfer**: `TransferEngine`, chunked file transfer in both directions
//! - **Clipboard**: change detection with echo suppression, and remote apply
//! - **Channel**: `ControlChannel`, the per-side dispatcher
//! - **Config**: `RelayConfig`, loaded from TOML
//! - **Error**: `RelayError`, a typed, `thiserror`-based error

pub mod channel;
pub mod clipboard;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod reconnect;
pub mod state;
pub mod transfer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use channel::{ChannelReceivers, ClipboardSync, ControlChannel};
pub use clipboard::{
    ClipboardBackend, ClipboardChange, ClipboardConfig, ClipboardFormat, ClipboardMonitor,
    ClipboardReceiver, MemoryClipboard, normalize_image,
};
pub use codec::{DEFAULT_MAX_FRAME, frame_codec};
pub use config::RelayConfig;
pub use error::RelayError;
pub use network::{ChannelTransport, DEFAULT_QUEUE_DEPTH, Link, LinkHandle, Transport};
pub use protocol::{DEFAULT_CHUNK_SIZE, Envelope, compute_total_chunks};
pub use reconnect::{
    BackoffPolicy, ReconnectConfig, ReconnectEvent, ReconnectionManager, Reconnector,
};
pub use state::LinkPhase;
pub use transfer::{TransferConfig, TransferEngine, TransferEvent, TransferState};

#[cfg(feature = "system-clipboard")]
pub use clipboard::SystemClipboard;
