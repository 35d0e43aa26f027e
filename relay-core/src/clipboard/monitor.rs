//! Local clipboard change detection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::clipboard::ClipboardConfig;
use crate::clipboard::backend::{ClipboardBackend, ClipboardFormat};
use crate::clipboard::image::normalize_image;
use crate::error::RelayError;

/// Depth of the change queue handed out by [`ClipboardMonitor::new`].
pub const CHANGE_QUEUE_DEPTH: usize = 16;

/// New local clipboard content, ready to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardChange {
    Text(String),
    /// Canonical PNG, or the raw bytes if they could not be decoded.
    Image(Vec<u8>),
}

/// Digests of the most recently seen or applied content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub last_text_hash: Option<blake3::Hash>,
    pub last_image_hash: Option<blake3::Hash>,
}

struct Detector {
    backend: Arc<dyn ClipboardBackend>,
    config: ClipboardConfig,
    snapshot: Mutex<ClipboardSnapshot>,
}

impl Detector {
    fn snapshot(&self) -> MutexGuard<'_, ClipboardSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One detection cycle.
    fn detect(&self) -> Vec<ClipboardChange> {
        let mut changes = Vec::new();

        if let Some(text) = self.read_nonempty(ClipboardFormat::Text) {
            let hash = blake3::hash(&text);
            if self.replace_hash(|s| &mut s.last_text_hash, hash) {
                if text.len() > self.config.max_text_bytes {
                    let err = RelayError::PayloadTooLarge {
                        size: text.len(),
                        max: self.config.max_text_bytes,
                    };
                    warn!("skipping clipboard text: {err}");
                } else {
                    let text = String::from_utf8(text)
                        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
                    debug!(len = text.len(), "clipboard text changed");
                    changes.push(ClipboardChange::Text(text));
                }
            }
        }

        if !self.config.watch_images {
            return changes;
        }
        if let Some(image) = self.read_nonempty(ClipboardFormat::Image) {
            let hash = blake3::hash(&image);
            if self.replace_hash(|s| &mut s.last_image_hash, hash) {
                if image.len() > self.config.max_image_bytes {
                    let err = RelayError::PayloadTooLarge {
                        size: image.len(),
                        max: self.config.max_image_bytes,
                    };
                    warn!("skipping clipboard image: {err}");
                } else {
                    let png = normalize_image(&image);
                    debug!(len = png.len(), "clipboard image changed");
                    changes.push(ClipboardChange::Image(png));
                }
            }
        }

        changes
    }

    fn read_nonempty(&self, format: ClipboardFormat) -> Option<Vec<u8>> {
        self.backend.read(format).filter(|data| !data.is_empty())
    }

    /// Store `hash` in the selected slot. Returns whether it differed.
    fn replace_hash(
        &self,
        slot: impl FnOnce(&mut ClipboardSnapshot) -> &mut Option<blake3::Hash>,
        hash: blake3::Hash,
    ) -> bool {
        let mut snapshot = self.snapshot();
        let current = slot(&mut snapshot);
        if *current == Some(hash) {
            return false;
        }
        *current = Some(hash);
        true
    }
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls the local clipboard and reports content that has not been seen.
pub struct ClipboardMonitor {
    detector: Arc<Detector>,
    changes: mpsc::Sender<ClipboardChange>,
    running: Mutex<Option<Running>>,
    span: Span,
}

impl std::fmt::Debug for ClipboardMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardMonitor")
            .field("config", &self.detector.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ClipboardMonitor {
    /// Create a monitor and the receiver its loop reports changes on.
    pub fn new(
        backend: Arc<dyn ClipboardBackend>,
        config: ClipboardConfig,
    ) -> (Self, mpsc::Receiver<ClipboardChange>) {
        Self::with_span(backend, config, info_span!("clipboard"))
    }

    pub fn with_span(
        backend: Arc<dyn ClipboardBackend>,
        config: ClipboardConfig,
        span: Span,
    ) -> (Self, mpsc::Receiver<ClipboardChange>) {
        let (changes, rx) = mpsc::channel(CHANGE_QUEUE_DEPTH);
        let monitor = Self {
            detector: Arc::new(Detector {
                backend,
                config,
                snapshot: Mutex::new(ClipboardSnapshot::default()),
            }),
            changes,
            running: Mutex::new(None),
            span,
        };
        (monitor, rx)
    }

    pub fn config(&self) -> &ClipboardConfig {
        &self.detector.config
    }

    pub fn snapshot(&self) -> ClipboardSnapshot {
        *self.detector.snapshot()
    }

    /// Run one detection cycle on the calling thread.
    pub fn poll_once(&self) -> Vec<ClipboardChange> {
        let _enter = self.span.enter();
        self.detector.detect()
    }

    /// Mark `text` as seen without reporting it. Returns the digest it
    /// replaced, for [`restore_text_hash`](Self::restore_text_hash).
    pub fn remember_text(&self, text: &str) -> Option<blake3::Hash> {
        self.detector
            .snapshot()
            .last_text_hash
            .replace(blake3::hash(text.as_bytes()))
    }

    /// Mark `data` as seen without reporting it. Returns the digest it replaced.
    pub fn remember_image(&self, data: &[u8]) -> Option<blake3::Hash> {
        self.detector
            .snapshot()
            .last_image_hash
            .replace(blake3::hash(data))
    }

    /// Put back a text digest returned by `remember_text`.
    pub fn restore_text_hash(&self, previous: Option<blake3::Hash>) {
        self.detector.snapshot().last_text_hash = previous;
    }

    /// Put back an image digest returned by `remember_image`.
    pub fn restore_image_hash(&self, previous: Option<blake3::Hash>) {
        self.detector.snapshot().last_image_hash = previous;
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Initialize the backend and start polling.
    ///
    /// Returns `Ok(false)` if the loop was already running.
    pub fn start(&self) -> Result<bool, RelayError> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(false);
        }
        self.detector.backend.init()?;

        let token = CancellationToken::new();
        let task = tokio::spawn(
            poll_loop(
                Arc::clone(&self.detector),
                self.changes.clone(),
                token.clone(),
            )
            .instrument(self.span.clone()),
        );
        *running = Some(Running { token, task });
        info!(parent: &self.span, interval = ?self.detector.config.poll_interval, "clipboard monitor started");
        Ok(true)
    }

    /// Stop polling. Returns `false` if the loop was not running.
    pub fn stop(&self) -> bool {
        let Some(Running { token, task }) = self.running().take() else {
            return false;
        };
        token.cancel();
        drop(task);
        info!(parent: &self.span, "clipboard monitor stopped");
        true
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClipboardMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.token.cancel();
        }
    }
}

async fn poll_loop(
    detector: Arc<Detector>,
    changes: mpsc::Sender<ClipboardChange>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(detector.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if token.is_cancelled() {
            break;
        }

        let cycle = Arc::clone(&detector);
        let span = Span::current();
        let detected =
            tokio::task::spawn_blocking(move || span.in_scope(|| cycle.detect())).await;
        let detected = match detected {
            Ok(detected) => detected,
            Err(e) => {
                warn!("clipboard poll failed: {e}");
                continue;
            }
        };

        for change in detected {
            tokio::select! {
                _ = token.cancelled() => return,
                sent = changes.send(change) => {
                    if sent.is_err() {
                        debug!("change receiver dropped, stopping monitor");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::clipboard::image::tests::sample_png;
    use std::time::Duration;

    fn monitor_with(
        config: ClipboardConfig,
    ) -> (MemoryClipboard, ClipboardMonitor, mpsc::Receiver<ClipboardChange>) {
        let clip = MemoryClipboard::new();
        let (monitor, rx) = ClipboardMonitor::new(Arc::new(clip.clone()), config);
        (clip, monitor, rx)
    }

    fn monitor() -> (MemoryClipboard, ClipboardMonitor, mpsc::Receiver<ClipboardChange>) {
        monitor_with(ClipboardConfig::default())
    }

    #[test]
    fn identical_reads_report_once() {
        let (clip, monitor, _rx) = monitor();
        clip.set_text("hello");
        assert_eq!(
            monitor.poll_once(),
            vec![ClipboardChange::Text("hello".into())]
        );
        assert!(monitor.poll_once().is_empty());

        clip.set_text("world");
        assert_eq!(
            monitor.poll_once(),
            vec![ClipboardChange::Text("world".into())]
        );
    }

    #[test]
    fn empty_clipboard_reports_nothing() {
        let (clip, monitor, _rx) = monitor();
        assert!(monitor.poll_once().is_empty());
        clip.set_text("");
        assert!(monitor.poll_once().is_empty());
        assert_eq!(monitor.snapshot(), ClipboardSnapshot::default());
    }

    #[test]
    fn oversized_text_is_dropped_but_remembered() {
        let (clip, monitor, _rx) = monitor();
        clip.set_text("x".repeat(MAX_TEXT + 1));
        clip.set_image(sample_png());

        let changes = monitor.poll_once();
        // the image is still checked in the same cycle
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], ClipboardChange::Image(_)));
        assert!(monitor.snapshot().last_text_hash.is_some());
        assert!(monitor.poll_once().is_empty());
    }

    #[test]
    fn text_at_the_limit_is_forwarded() {
        let (clip, monitor, _rx) = monitor();
        clip.set_text("y".repeat(MAX_TEXT));
        assert_eq!(monitor.poll_once().len(), 1);
    }

    #[test]
    fn remembered_text_is_not_reported() {
        let (clip, monitor, _rx) = monitor();
        monitor.remember_text("from peer");
        clip.set_text("from peer");
        assert!(monitor.poll_once().is_empty());
    }

    #[test]
    fn remembered_image_is_not_reported() {
        let (clip, monitor, _rx) = monitor();
        let png = sample_png();
        monitor.remember_image(&png);
        clip.set_image(png);
        assert!(monitor.poll_once().is_empty());
    }

    #[test]
    fn images_are_normalized() {
        let (clip, monitor, _rx) = monitor();
        let png = sample_png();
        clip.set_image(png.clone());
        assert_eq!(
            monitor.poll_once(),
            vec![ClipboardChange::Image(normalize_image(&png))]
        );
    }

    #[test]
    fn undecodable_images_pass_through() {
        let (clip, monitor, _rx) = monitor();
        clip.set_image(b"raw bytes".to_vec());
        assert_eq!(
            monitor.poll_once(),
            vec![ClipboardChange::Image(b"raw bytes".to_vec())]
        );
    }

    #[test]
    fn oversized_image_is_dropped() {
        let (clip, monitor, _rx) = monitor_with(ClipboardConfig {
            max_image_bytes: 4,
            ..Default::default()
        });
        clip.set_image(vec![0; 5]);
        assert!(monitor.poll_once().is_empty());
        assert!(monitor.snapshot().last_image_hash.is_some());
    }

    #[test]
    fn images_ignored_when_not_watched() {
        let (clip, monitor, _rx) = monitor_with(ClipboardConfig {
            watch_images: false,
            ..Default::default()
        });
        clip.set_image(sample_png());
        assert!(monitor.poll_once().is_empty());
        assert!(monitor.snapshot().last_image_hash.is_none());
    }

    #[tokio::test]
    async fn loop_reports_changes_until_stopped() {
        let (clip, monitor, mut rx) = monitor_with(ClipboardConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        assert!(monitor.start().unwrap());
        assert!(!monitor.start().unwrap());
        assert!(monitor.is_running());
        assert_eq!(clip.init_count(), 1);

        clip.set_text("copied");
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, ClipboardChange::Text("copied".into()));

        assert!(monitor.stop());
        assert!(!monitor.stop());
        assert!(!monitor.is_running());

        clip.set_text("after stop");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_interrupts_a_blocked_send() {
        let clip = MemoryClipboard::new();
        let detector = Arc::new(Detector {
            backend: Arc::new(clip.clone()),
            config: ClipboardConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            snapshot: Mutex::new(ClipboardSnapshot::default()),
        });
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(ClipboardChange::Text("queued".into())).unwrap();
        clip.set_text("pending");

        let token = CancellationToken::new();
        let task = tokio::spawn(poll_loop(detector, tx, token.clone()));
        // Long enough for a poll to detect "pending" and park on the full queue.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should exit while the queue is full")
            .unwrap();
        assert_eq!(rx.recv().await, Some(ClipboardChange::Text("queued".into())));
        assert_eq!(rx.recv().await, None);
    }

    const MAX_TEXT: usize = crate::clipboard::MAX_TEXT_BYTES;
}
