//! Clipboard synchronization.
//!
//! | Module     | Purpose                                                 |
//! |------------|---------------------------------------------------------|
//! | `backend`  | Clipboard access trait and the in-memory backend        |
//! | `system`   | OS clipboard via `arboard` (feature `system-clipboard`) |
//! | `image`    | Canonical PNG normalization                             |
//! | `monitor`  | Polls for local changes, with echo suppression          |
//! | `receiver` | Applies remote content locally                          |
//!
//! The monitor and the receiver are independent halves. Whoever applies
//! remote content through the receiver must call `remember_*` on the
//! monitor with the bytes actually written, otherwise the next poll
//! forwards the same content straight back.

pub mod backend;
pub mod image;
pub mod monitor;
pub mod receiver;
#[cfg(feature = "system-clipboard")]
pub mod system;

use std::time::Duration;

pub use backend::{ClipboardBackend, ClipboardFormat, MemoryClipboard};
pub use self::image::normalize_image;
pub use monitor::{ClipboardChange, ClipboardMonitor};
pub use receiver::ClipboardReceiver;
#[cfg(feature = "system-clipboard")]
pub use system::SystemClipboard;

/// Largest text payload forwarded to the peer (10 MiB).
pub const MAX_TEXT_BYTES: usize = 10 * 1024 * 1024;

/// Largest image payload forwarded to the peer (50 MiB).
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_text_bytes: usize,
    pub max_image_bytes: usize,
    /// Track and forward images as well as text.
    pub watch_images: bool,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_text_bytes: MAX_TEXT_BYTES,
            max_image_bytes: MAX_IMAGE_BYTES,
            watch_images: true,
        }
    }
}
