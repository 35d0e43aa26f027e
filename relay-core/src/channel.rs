//! One side of a control session.
//!
//! The channel is the single reader of inbound frames: it decodes each
//! frame once and routes it to the transfer engine or the clipboard
//! receiver. Local clipboard changes go out through the same transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::clipboard::{ClipboardBackend, ClipboardChange, ClipboardMonitor, ClipboardReceiver};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::network::Transport;
use crate::protocol::Envelope;
use crate::transfer::{TransferEngine, TransferEvent};

/// The two clipboard halves of one side.
#[derive(Debug, Clone)]
pub struct ClipboardSync {
    pub monitor: Arc<ClipboardMonitor>,
    pub receiver: Arc<ClipboardReceiver>,
}

/// Observer channels handed out by [`ControlChannel::from_config`].
#[derive(Debug)]
pub struct ChannelReceivers {
    /// Local clipboard changes; `None` when clipboard sync is disabled.
    pub clipboard_changes: Option<mpsc::Receiver<ClipboardChange>>,
    pub transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
}

/// Dispatcher tying the transport, the transfer engine and clipboard sync together.
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    transfers: Arc<TransferEngine>,
    clipboard: Option<ClipboardSync>,
    span: Span,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("transfers", &self.transfers)
            .field("clipboard", &self.clipboard.is_some())
            .finish()
    }
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn Transport>, transfers: Arc<TransferEngine>) -> Self {
        Self {
            transport,
            transfers,
            clipboard: None,
            span: info_span!("channel"),
        }
    }

    /// Assemble a channel and its components from configuration.
    ///
    /// `side` names the component spans. Clipboard sync is wired up only
    /// when it is enabled and a backend is given.
    pub fn from_config(
        config: &RelayConfig,
        transport: Arc<dyn Transport>,
        backend: Option<Arc<dyn ClipboardBackend>>,
        side: &'static str,
    ) -> (Self, ChannelReceivers) {
        let (engine, transfer_events) = TransferEngine::with_span(
            Arc::clone(&transport),
            config.transfer_config(),
            info_span!("transfer", side),
        );
        let mut channel = Self::new(transport, Arc::new(engine)).with_span(info_span!("channel", side));

        let clipboard = config.clipboard_config();
        let mut clipboard_changes = None;
        if let Some(backend) = backend.filter(|_| clipboard.enabled) {
            let (monitor, changes) =
                ClipboardMonitor::with_span(Arc::clone(&backend), clipboard, info_span!("clipboard", side));
            let receiver = ClipboardReceiver::with_span(backend, info_span!("clipboard", side));
            channel = channel.with_clipboard(ClipboardSync {
                monitor: Arc::new(monitor),
                receiver: Arc::new(receiver),
            });
            clipboard_changes = Some(changes);
        }

        let receivers = ChannelReceivers {
            clipboard_changes,
            transfer_events,
        };
        (channel, receivers)
    }

    /// Enable clipboard sync.
    pub fn with_clipboard(mut self, clipboard: ClipboardSync) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn transfers(&self) -> &Arc<TransferEngine> {
        &self.transfers
    }

    pub fn clipboard(&self) -> Option<&ClipboardSync> {
        self.clipboard.as_ref()
    }

    /// Decode and apply one inbound frame.
    pub async fn handle_incoming(&self, frame: &[u8]) -> Result<(), RelayError> {
        let envelope = Envelope::from_bytes(frame)?;
        debug!(parent: &self.span, kind = envelope.kind(), len = frame.len(), "inbound envelope");
        match envelope {
            Envelope::ClipboardText { content } => self.apply_text(content).await,
            Envelope::ClipboardImage { content } => self.apply_image(content).await,
            transfer => self.transfers.handle(transfer).await,
        }
    }

    // The monitor learns the content before it lands on the clipboard, so a
    // poll during the write cannot send it back. A failed write restores
    // the previous digest.
    async fn apply_text(&self, content: String) -> Result<(), RelayError> {
        let Some(sync) = &self.clipboard else {
            debug!(parent: &self.span, "clipboard sync disabled; dropping text");
            return Ok(());
        };
        let ClipboardSync { monitor, receiver } = sync.clone();
        blocking(move || {
            let previous = monitor.remember_text(&content);
            receiver
                .set_text(&content)
                .inspect_err(|_| monitor.restore_text_hash(previous))
        })
        .await
    }

    async fn apply_image(&self, content: Vec<u8>) -> Result<(), RelayError> {
        let Some(sync) = &self.clipboard else {
            debug!(parent: &self.span, "clipboard sync disabled; dropping image");
            return Ok(());
        };
        let ClipboardSync { monitor, receiver } = sync.clone();
        blocking(move || {
            let bytes = receiver.canonical_image(&content);
            let previous = monitor.remember_image(&bytes);
            receiver
                .write_image(&bytes)
                .inspect_err(|_| monitor.restore_image_hash(previous))
        })
        .await
    }

    /// Send a local clipboard change to the peer.
    pub async fn forward_clipboard(&self, change: ClipboardChange) -> Result<(), RelayError> {
        let envelope = match change {
            ClipboardChange::Text(content) => Envelope::ClipboardText { content },
            ClipboardChange::Image(content) => Envelope::ClipboardImage { content },
        };
        debug!(parent: &self.span, kind = envelope.kind(), "forwarding clipboard");
        self.transport.send_envelope(&envelope).await
    }

    /// Drain inbound frames and local clipboard changes until `token` is
    /// cancelled or the inbound queue closes, then discard open transfers.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut clipboard_changes: Option<mpsc::Receiver<ClipboardChange>>,
        token: CancellationToken,
    ) {
        let span = self.span.clone();
        async move {
            let mut changes_open = clipboard_changes.is_some();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("control channel cancelled");
                        break;
                    }
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = self.handle_incoming(&frame).await {
                                warn!("inbound envelope failed: {e}");
                            }
                        }
                        None => {
                            info!("inbound queue closed");
                            break;
                        }
                    },
                    change = next_change(&mut clipboard_changes), if changes_open => match change {
                        Some(change) => {
                            if let Err(e) = self.forward_clipboard(change).await {
                                warn!("failed to forward clipboard: {e}");
                            }
                        }
                        None => changes_open = false,
                    },
                }
            }

            let closed = self.transfers.cleanup().await;
            info!(closed, "control channel stopped");
        }
        .instrument(span)
        .await
    }
}

async fn blocking<F>(f: F) -> Result<(), RelayError>
where
    F: FnOnce() -> Result<(), RelayError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::Clipboard(format!("clipboard task failed: {e}")))?
}

async fn next_change(rx: &mut Option<mpsc::Receiver<ClipboardChange>>) -> Option<ClipboardChange> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ClipboardConfig, MemoryClipboard};
    use crate::network::ChannelTransport;
    use crate::transfer::TransferConfig;
    use std::path::Path;

    struct Fixture {
        channel: ControlChannel,
        outbox: mpsc::Receiver<Vec<u8>>,
        clip: MemoryClipboard,
        changes: mpsc::Receiver<ClipboardChange>,
    }

    fn fixture(download_dir: &Path) -> Fixture {
        let clip = MemoryClipboard::new();
        fixture_with(download_dir, clip.clone(), Arc::new(clip), ClipboardConfig::default())
    }

    fn fixture_with(
        download_dir: &Path,
        clip: MemoryClipboard,
        backend: Arc<dyn ClipboardBackend>,
        clipboard: ClipboardConfig,
    ) -> Fixture {
        let (transport, outbox) = ChannelTransport::channel(64);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (engine, _events) = TransferEngine::new(
            Arc::clone(&transport),
            TransferConfig {
                download_dir: download_dir.to_path_buf(),
                ..Default::default()
            },
        );
        let (monitor, changes) = ClipboardMonitor::new(Arc::clone(&backend), clipboard);
        let channel = ControlChannel::new(transport, Arc::new(engine)).with_clipboard(ClipboardSync {
            monitor: Arc::new(monitor),
            receiver: Arc::new(ClipboardReceiver::new(backend)),
        });
        Fixture {
            channel,
            outbox,
            clip,
            changes,
        }
    }

    fn frame(envelope: &Envelope) -> Vec<u8> {
        envelope.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn remote_text_is_applied_without_echo() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.channel
            .handle_incoming(&frame(&Envelope::ClipboardText {
                content: "from peer".into(),
            }))
            .await
            .unwrap();

        assert_eq!(f.clip.text().as_deref(), Some("from peer"));
        let monitor = &f.channel.clipboard().unwrap().monitor;
        assert!(monitor.poll_once().is_empty());
    }

    #[tokio::test]
    async fn remote_image_is_applied_without_echo() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let png = crate::clipboard::image::tests::sample_png();
        f.channel
            .handle_incoming(&frame(&Envelope::ClipboardImage { content: png }))
            .await
            .unwrap();

        assert!(f.clip.image().is_some());
        let monitor = &f.channel.clipboard().unwrap().monitor;
        assert!(monitor.poll_once().is_empty());
    }

    /// Writes through to a [`MemoryClipboard`], then lingers inside `write`
    /// the way a slow OS clipboard does. `fail_writes` makes every write fail.
    struct SlowClipboard {
        inner: MemoryClipboard,
        delay: std::time::Duration,
        fail_writes: bool,
    }

    impl ClipboardBackend for SlowClipboard {
        fn init(&self) -> Result<(), RelayError> {
            self.inner.init()
        }
        fn read(&self, format: crate::clipboard::ClipboardFormat) -> Option<Vec<u8>> {
            self.inner.read(format)
        }
        fn write(&self, format: crate::clipboard::ClipboardFormat, data: &[u8]) -> Result<(), RelayError> {
            if self.fail_writes {
                return Err(RelayError::Clipboard("write refused".into()));
            }
            self.inner.write(format, data)?;
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    fn slow_fixture(download_dir: &Path, fail_writes: bool) -> Fixture {
        let clip = MemoryClipboard::new();
        let backend = Arc::new(SlowClipboard {
            inner: clip.clone(),
            delay: std::time::Duration::from_millis(100),
            fail_writes,
        });
        let config = ClipboardConfig {
            poll_interval: std::time::Duration::from_millis(10),
            ..Default::default()
        };
        fixture_with(download_dir, clip, backend, config)
    }

    #[tokio::test]
    async fn running_monitor_does_not_echo_a_slow_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = slow_fixture(dir.path(), false);
        let monitor = Arc::clone(&f.channel.clipboard().unwrap().monitor);
        monitor.start().unwrap();

        f.channel
            .handle_incoming(&frame(&Envelope::ClipboardText {
                content: "from peer".into(),
            }))
            .await
            .unwrap();
        let png = crate::clipboard::image::tests::sample_png();
        f.channel
            .handle_incoming(&frame(&Envelope::ClipboardImage { content: png }))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        monitor.stop();

        assert_eq!(f.clip.text().as_deref(), Some("from peer"));
        assert!(f.clip.image().is_some());
        assert!(f.changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_write_restores_the_previous_digest() {
        let dir = tempfile::tempdir().unwrap();
        let f = slow_fixture(dir.path(), true);
        let monitor = &f.channel.clipboard().unwrap().monitor;
        monitor.remember_text("earlier");
        let before = monitor.snapshot();

        let err = f
            .channel
            .handle_incoming(&frame(&Envelope::ClipboardText {
                content: "from peer".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Clipboard(_)));
        assert_eq!(monitor.snapshot(), before);

        // the same text copied locally is still news
        f.clip.set_text("from peer");
        assert_eq!(
            monitor.poll_once(),
            vec![ClipboardChange::Text("from peer".into())]
        );
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(dir.path());
        let err = f
            .channel
            .handle_incoming(br#"{"type":"screen_frame"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
        assert!(f.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn transfer_envelopes_reach_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(dir.path());
        f.channel
            .handle_incoming(&frame(&Envelope::FileTransferStart {
                id: "t1".into(),
                filename: "a.txt".into(),
                size: 2,
            }))
            .await
            .unwrap();
        f.channel
            .handle_incoming(&frame(&Envelope::FileChunk {
                id: "t1".into(),
                offset: 0,
                data: b"hi".to_vec(),
            }))
            .await
            .unwrap();
        f.channel
            .handle_incoming(&frame(&Envelope::FileTransferComplete { id: "t1".into() }))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hi");
        let ack = Envelope::from_bytes(&f.outbox.recv().await.unwrap()).unwrap();
        assert_eq!(ack, Envelope::FileTransferComplete { id: "t1".into() });
    }

    #[tokio::test]
    async fn clipboard_disabled_drops_content() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _outbox) = ChannelTransport::channel(4);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (engine, _events) = TransferEngine::new(
            Arc::clone(&transport),
            TransferConfig {
                download_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        let channel = ControlChannel::new(transport, Arc::new(engine));
        channel
            .handle_incoming(&frame(&Envelope::ClipboardText {
                content: "ignored".into(),
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_forwards_changes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let Fixture {
            channel,
            mut outbox,
            clip,
            changes,
        } = fixture(dir.path());

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        inbound_tx
            .send(frame(&Envelope::FileTransferStart {
                id: "open".into(),
                filename: "pending.bin".into(),
                size: 100,
            }))
            .await
            .unwrap();

        let channel = Arc::new(channel);
        let token = CancellationToken::new();
        let runner = {
            let channel = Arc::clone(&channel);
            let token = token.clone();
            tokio::spawn(async move { channel.run(inbound_rx, Some(changes), token).await })
        };

        // a local copy travels out as an envelope
        clip.set_text("local copy");
        let monitor = &channel.clipboard().unwrap().monitor;
        monitor.start().unwrap();
        let sent = Envelope::from_bytes(&outbox.recv().await.unwrap()).unwrap();
        assert_eq!(
            sent,
            Envelope::ClipboardText {
                content: "local copy".into()
            }
        );
        monitor.stop();

        // closing the inbound queue ends the loop and discards open transfers
        drop(inbound_tx);
        runner.await.unwrap();
        assert_eq!(channel.transfers().active_sessions(), 0);
        assert!(!dir.path().join("pending.bin").exists());
    }

    #[tokio::test]
    async fn from_config_honors_clipboard_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.transfer.download_dir = dir.path().to_path_buf();
        let backend: Arc<dyn ClipboardBackend> = Arc::new(MemoryClipboard::new());

        let (transport, _outbox) = ChannelTransport::channel(4);
        let (channel, receivers) =
            ControlChannel::from_config(&config, Arc::new(transport), Some(Arc::clone(&backend)), "agent");
        assert!(channel.clipboard().is_some());
        assert!(receivers.clipboard_changes.is_some());
        assert_eq!(channel.transfers().config().download_dir, dir.path());

        config.clipboard.enabled = false;
        let (transport, _outbox) = ChannelTransport::channel(4);
        let (channel, receivers) =
            ControlChannel::from_config(&config, Arc::new(transport), Some(backend), "agent");
        assert!(channel.clipboard().is_none());
        assert!(receivers.clipboard_changes.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let (_inbound_tx, inbound_rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        token.cancel();
        f.channel.run(inbound_rx, None, token).await;
    }
}
