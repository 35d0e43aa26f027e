//! Applies clipboard content received from the peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Span, debug, info, info_span};

use crate::clipboard::backend::{ClipboardBackend, ClipboardFormat};
use crate::clipboard::image::reencode_png;
use crate::error::RelayError;

/// Writes remote content to the local clipboard, initializing it on first use.
pub struct ClipboardReceiver {
    backend: Arc<dyn ClipboardBackend>,
    initialized: AtomicBool,
    span: Span,
}

impl std::fmt::Debug for ClipboardReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardReceiver")
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .finish()
    }
}

impl ClipboardReceiver {
    pub fn new(backend: Arc<dyn ClipboardBackend>) -> Self {
        Self::with_span(backend, info_span!("clipboard"))
    }

    pub fn with_span(backend: Arc<dyn ClipboardBackend>, span: Span) -> Self {
        Self {
            backend,
            initialized: AtomicBool::new(false),
            span,
        }
    }

    fn ensure_init(&self) -> Result<(), RelayError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.backend.init()?;
        self.initialized.store(true, Ordering::Release);
        debug!(parent: &self.span, "clipboard receiver initialized");
        Ok(())
    }

    /// Put `text` on the local clipboard.
    pub fn set_text(&self, text: &str) -> Result<(), RelayError> {
        self.ensure_init()?;
        self.backend.write(ClipboardFormat::Text, text.as_bytes())?;
        info!(parent: &self.span, len = text.len(), "clipboard updated with text");
        Ok(())
    }

    /// Put an image on the local clipboard and return the bytes written.
    pub fn set_image(&self, data: &[u8]) -> Result<Vec<u8>, RelayError> {
        let bytes = self.canonical_image(data);
        self.write_image(&bytes)?;
        Ok(bytes)
    }

    /// The bytes [`set_image`](Self::set_image) would write for `data`.
    ///
    /// PNG input is re-encoded canonically; anything else is kept as-is.
    pub fn canonical_image(&self, data: &[u8]) -> Vec<u8> {
        match reencode_png(data) {
            Ok(png) => png,
            Err(e) => {
                debug!(parent: &self.span, "keeping raw image bytes: {e}");
                data.to_vec()
            }
        }
    }

    /// Write already-canonical image bytes.
    pub fn write_image(&self, bytes: &[u8]) -> Result<(), RelayError> {
        self.ensure_init()?;
        self.backend.write(ClipboardFormat::Image, bytes)?;
        info!(parent: &self.span, len = bytes.len(), "clipboard updated with image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::clipboard::image::normalize_image;
    use crate::clipboard::image::tests::sample_png;

    #[test]
    fn initializes_lazily_once() {
        let clip = MemoryClipboard::new();
        let receiver = ClipboardReceiver::new(Arc::new(clip.clone()));
        assert_eq!(clip.init_count(), 0);

        receiver.set_text("a").unwrap();
        receiver.set_text("b").unwrap();
        assert_eq!(clip.init_count(), 1);
        assert_eq!(clip.text().as_deref(), Some("b"));
    }

    #[test]
    fn png_is_written_canonically() {
        let clip = MemoryClipboard::new();
        let receiver = ClipboardReceiver::new(Arc::new(clip.clone()));
        let png = sample_png();

        let written = receiver.set_image(&png).unwrap();
        assert_eq!(written, normalize_image(&png));
        assert_eq!(clip.image(), Some(written));
    }

    #[test]
    fn undecodable_image_is_written_raw() {
        let clip = MemoryClipboard::new();
        let receiver = ClipboardReceiver::new(Arc::new(clip.clone()));

        let written = receiver.set_image(b"\x00\x01opaque").unwrap();
        assert_eq!(written, b"\x00\x01opaque");
        assert_eq!(clip.image().unwrap(), b"\x00\x01opaque");
    }

    struct Broken;

    impl ClipboardBackend for Broken {
        fn init(&self) -> Result<(), RelayError> {
            Err(RelayError::Clipboard("no display".into()))
        }
        fn read(&self, _: ClipboardFormat) -> Option<Vec<u8>> {
            None
        }
        fn write(&self, _: ClipboardFormat, _: &[u8]) -> Result<(), RelayError> {
            Ok(())
        }
    }

    #[test]
    fn init_failure_is_reported_and_retried() {
        let receiver = ClipboardReceiver::new(Arc::new(Broken));
        assert!(matches!(receiver.set_text("x"), Err(RelayError::Clipboard(_))));
        assert!(receiver.set_image(&[1]).is_err());
    }
}
