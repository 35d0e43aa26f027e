//! Agent service core logic.
//!
//! Owns the persistent link, the control channel and its background
//! tasks, and a TCP listener that accepts one controller at a time.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use relay_core::{
    ClipboardBackend, ControlChannel, DEFAULT_QUEUE_DEPTH, Link, RelayConfig, RelayError,
    TransferEvent, Transport,
};

// ── AgentService ─────────────────────────────────────────────────

/// The top-level agent service.
pub struct AgentService {
    config: RelayConfig,
    clipboard: Option<Arc<dyn ClipboardBackend>>,
    token: CancellationToken,
}

impl AgentService {
    /// Create a service using the platform clipboard.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_clipboard(config, default_clipboard())
    }

    /// Create a service with an explicit clipboard backend (`None` disables sync).
    pub fn with_clipboard(config: RelayConfig, clipboard: Option<Arc<dyn ClipboardBackend>>) -> Self {
        Self {
            config,
            clipboard,
            token: CancellationToken::new(),
        }
    }

    /// A token that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the service has been told to stop.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bind `network.address` and serve until stopped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.network.address).await?;
        info!("agent listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve controllers from an already bound listener until stopped.
    ///
    /// 1. Builds the link and the control channel.
    /// 2. Starts the channel loop, the idle sweeper and the clipboard monitor.
    /// 3. Accepts a controller, attaches it and waits for it to go away.
    /// 4. Tears everything down once the stop token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let (link, inbound) = Link::new(self.config.network.max_frame_bytes, DEFAULT_QUEUE_DEPTH);
        let transport: Arc<dyn Transport> = Arc::new(link.transport());
        let (channel, receivers) =
            ControlChannel::from_config(&self.config, transport, self.clipboard.clone(), "agent");
        let channel = Arc::new(channel);

        let events = tokio::spawn(log_transfer_events(receivers.transfer_events));
        let sweeper = channel.transfers().spawn_idle_sweeper(self.token.child_token());
        let runner = tokio::spawn({
            let channel = Arc::clone(&channel);
            let token = self.token.child_token();
            async move {
                channel
                    .run(inbound, receivers.clipboard_changes, token)
                    .await
            }
        });

        if let Some(sync) = channel.clipboard() {
            match sync.monitor.start() {
                Ok(_) => info!("clipboard sync enabled"),
                Err(e) => warn!("clipboard monitor unavailable: {e}"),
            }
        }

        while !self.token.is_cancelled() {
            let accept = tokio::select! {
                _ = self.token.cancelled() => break,
                result = listener.accept() => result,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("set_nodelay failed for {peer}: {e}");
            }

            let span = info_span!("session", %peer);
            span.in_scope(|| info!("controller connected"));
            let handle = link.attach(stream);
            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = handle.closed() => span.in_scope(|| info!("controller disconnected")),
            }
            handle.close().await;
        }

        if let Some(sync) = channel.clipboard() {
            sync.monitor.stop();
        }
        // the child tokens fire with the parent
        let _ = runner.await;
        let _ = sweeper.await;
        drop(channel);
        drop(link);
        let _ = events.await;

        info!("agent service stopped");
        Ok(())
    }
}

/// Log transfer progress until the engine goes away.
async fn log_transfer_events(mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Started { id, filename, size } => {
                info!(%id, size, "receiving {filename}")
            }
            TransferEvent::Progress { id, percent, .. } => info!(%id, "received {percent}%"),
            TransferEvent::Completed { id, path, bytes } => {
                info!(%id, bytes, "saved {}", path.display())
            }
            TransferEvent::Failed { id, error } => warn!(%id, "transfer failed: {error}"),
            TransferEvent::Acknowledged { id } => info!(%id, "upload acknowledged"),
            TransferEvent::Sent { id, bytes, chunks } => info!(%id, bytes, chunks, "upload sent"),
        }
    }
}

#[cfg(feature = "system-clipboard")]
fn default_clipboard() -> Option<Arc<dyn ClipboardBackend>> {
    Some(Arc::new(relay_core::SystemClipboard::new()))
}

#[cfg(not(feature = "system-clipboard"))]
fn default_clipboard() -> Option<Arc<dyn ClipboardBackend>> {
    warn!("built without system-clipboard; clipboard sync is disabled");
    None
}

// ── Tests ────────────────────────────────────────────────────────
