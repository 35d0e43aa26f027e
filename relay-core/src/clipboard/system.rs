//! The operating system clipboard, through `arboard`.
//!
//! `arboard` exchanges images as raw RGBA; they are converted to and from
//! canonical PNG at this boundary.

use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard, PoisonError};

use arboard::{Clipboard, ImageData};
use tracing::{debug, info};

use crate::clipboard::backend::{ClipboardBackend, ClipboardFormat};
use crate::clipboard::image::{decode_rgba, rgba_to_png};
use crate::error::RelayError;

/// The desktop clipboard. Opened on first [`init`](ClipboardBackend::init)
/// and kept open so content written from this process stays available.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Mutex<Option<Clipboard>>,
}

impl std::fmt::Debug for SystemClipboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemClipboard")
            .field("open", &self.lock().is_some())
            .finish()
    }
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Clipboard>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_clipboard<T>(
        &self,
        f: impl FnOnce(&mut Clipboard) -> Result<T, RelayError>,
    ) -> Result<T, RelayError> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(open()?);
        }
        match guard.as_mut() {
            Some(clipboard) => f(clipboard),
            None => Err(RelayError::Clipboard("clipboard not open".into())),
        }
    }
}

fn open() -> Result<Clipboard, RelayError> {
    let clipboard = Clipboard::new()
        .map_err(|e| RelayError::Clipboard(format!("failed to access clipboard: {e}")))?;
    info!("system clipboard opened");
    Ok(clipboard)
}

impl ClipboardBackend for SystemClipboard {
    fn init(&self) -> Result<(), RelayError> {
        self.with_clipboard(|_| Ok(()))
    }

    fn read(&self, format: ClipboardFormat) -> Option<Vec<u8>> {
        let result = self.with_clipboard(|clipboard| match format {
            ClipboardFormat::Text => clipboard
                .get_text()
                .map(String::into_bytes)
                .map_err(|e| RelayError::Clipboard(e.to_string())),
            ClipboardFormat::Image => {
                let image = clipboard
                    .get_image()
                    .map_err(|e| RelayError::Clipboard(e.to_string()))?;
                rgba_to_png(image.width, image.height, image.bytes.into_owned())
            }
        });
        match result {
            Ok(data) => Some(data),
            Err(e) => {
                // empty clipboards are reported as errors too
                debug!(?format, "clipboard read: {e}");
                None
            }
        }
    }

    fn write(&self, format: ClipboardFormat, data: &[u8]) -> Result<(), RelayError> {
        match format {
            ClipboardFormat::Text => {
                let text = String::from_utf8_lossy(data).into_owned();
                self.with_clipboard(|clipboard| {
                    clipboard
                        .set_text(text)
                        .map_err(|e| RelayError::Clipboard(format!("failed to set text: {e}")))
                })
            }
            ClipboardFormat::Image => {
                let (width, height, rgba) = decode_rgba(data)?;
                self.with_clipboard(|clipboard| {
                    clipboard
                        .set_image(ImageData {
                            width,
                            height,
                            bytes: Cow::Owned(rgba),
                        })
                        .map_err(|e| RelayError::Clipboard(format!("failed to set image: {e}")))
                })
            }
        }
    }
}
