//! Clipboard access primitive.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RelayError;

/// Payload kinds the relay synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipboardFormat {
    /// UTF-8 text.
    Text,
    /// Encoded image bytes (PNG as far as the relay is concerned).
    Image,
}

/// Read and write access to one clipboard.
///
/// Calls may block; async callers run them on the blocking pool.
pub trait ClipboardBackend: Send + Sync {
    /// Prepare the backend. Safe to call more than once.
    fn init(&self) -> Result<(), RelayError>;

    /// Current contents in `format`, or `None` when there is nothing of
    /// that kind (or it could not be read).
    fn read(&self, format: ClipboardFormat) -> Option<Vec<u8>>;

    /// Replace the clipboard contents with `data`.
    fn write(&self, format: ClipboardFormat, data: &[u8]) -> Result<(), RelayError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    text: Option<Vec<u8>>,
    image: Option<Vec<u8>>,
    inits: usize,
}

/// A process-local clipboard. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place text on the clipboard as if a local application copied it.
    pub fn set_text(&self, text: impl Into<String>) {
        self.state().text = Some(text.into().into_bytes());
    }

    /// Place image bytes on the clipboard as if a local application copied them.
    pub fn set_image(&self, data: impl Into<Vec<u8>>) {
        self.state().image = Some(data.into());
    }

    pub fn text(&self) -> Option<String> {
        self.state()
            .text
            .as_ref()
            .map(|t| String::from_utf8_lossy(t).into_owned())
    }

    pub fn image(&self) -> Option<Vec<u8>> {
        self.state().image.clone()
    }

    /// How many times [`ClipboardBackend::init`] has been called.
    pub fn init_count(&self) -> usize {
        self.state().inits
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClipboardBackend for MemoryClipboard {
    fn init(&self) -> Result<(), RelayError> {
        self.state().inits += 1;
        Ok(())
    }

    fn read(&self, format: ClipboardFormat) -> Option<Vec<u8>> {
        let state = self.state();
        match format {
            ClipboardFormat::Text => state.text.clone(),
            ClipboardFormat::Image => state.image.clone(),
        }
    }

    fn write(&self, format: ClipboardFormat, data: &[u8]) -> Result<(), RelayError> {
        let mut state = self.state();
        match format {
            ClipboardFormat::Text => state.text = Some(data.to_vec()),
            ClipboardFormat::Image => state.image = Some(data.to_vec()),
        }
        Ok(())
    }
}
