//! Controller service core logic.
//!
//! Dials the agent, runs the control channel over a persistent link and
//! supervises the connection: a lost link starts the reconnection loop,
//! whose reconnector re-dials and re-attaches the link.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use relay_core::{
    ClipboardBackend, ControlChannel, DEFAULT_QUEUE_DEPTH, Link, LinkHandle, LinkPhase,
    ReconnectEvent, ReconnectionManager, RelayConfig, RelayError, TransferEvent, Transport,
};

/// Open a TCP connection to the agent within `timeout`.
pub async fn dial(address: &str, timeout: Duration) -> Result<TcpStream, RelayError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// ── ControllerService ────────────────────────────────────────────

/// The top-level controller service.
pub struct ControllerService {
    config: RelayConfig,
    clipboard: Option<Arc<dyn ClipboardBackend>>,
    queued: Queued,
    token: CancellationToken,
}

/// Work handed to the agent once the first connection is up.
#[derive(Debug, Clone, Default)]
struct Queued {
    uploads: Vec<PathBuf>,
    /// Paths under the agent's shared directory to download.
    fetches: Vec<String>,
}

impl ControllerService {
    /// Create a service using the platform clipboard.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_clipboard(config, default_clipboard())
    }

    /// Create a service with an explicit clipboard backend (`None` disables sync).
    pub fn with_clipboard(config: RelayConfig, clipboard: Option<Arc<dyn ClipboardBackend>>) -> Self {
        Self {
            config,
            clipboard,
            queued: Queued::default(),
            token: CancellationToken::new(),
        }
    }

    /// Files to upload once the first connection is up.
    pub fn with_uploads(mut self, uploads: Vec<PathBuf>) -> Self {
        self.queued.uploads = uploads;
        self
    }

    /// Files to request from the agent's shared directory once connected.
    pub fn with_fetches(mut self, fetches: Vec<String>) -> Self {
        self.queued.fetches = fetches;
        self
    }

    /// A token that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run until stopped, or until the reconnection loop gives up.
    pub async fn run(&self) -> Result<(), RelayError> {
        let (link, inbound) = Link::new(self.config.network.max_frame_bytes, DEFAULT_QUEUE_DEPTH);
        let link = Arc::new(link);
        let transport: Arc<dyn Transport> = Arc::new(link.transport());
        let (channel, receivers) =
            ControlChannel::from_config(&self.config, transport, self.clipboard.clone(), "controller");
        let channel = Arc::new(channel);

        let session_token = self.token.child_token();
        let events = tokio::spawn(log_transfer_events(receivers.transfer_events));
        let sweeper = channel.transfers().spawn_idle_sweeper(session_token.clone());
        let runner = tokio::spawn({
            let channel = Arc::clone(&channel);
            let token = session_token.clone();
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

        let slot: Arc<Mutex<Option<LinkHandle>>> = Arc::new(Mutex::new(None));
        let address = self.config.network.address.clone();
        let connect_timeout = self.config.connect_timeout();
        let reconnector = {
            let link = Arc::clone(&link);
            let slot = Arc::clone(&slot);
            let address = address.clone();
            move || {
                let link = Arc::clone(&link);
                let slot = Arc::clone(&slot);
                let address = address.clone();
                async move {
                    let stream = dial(&address, connect_timeout).await?;
                    *slot.lock().await = Some(link.attach(stream));
                    Ok::<(), RelayError>(())
                }
            }
        };
        let (manager, mut reconnect_events) = ReconnectionManager::with_span(
            self.config.reconnect_config(),
            reconnector,
            info_span!("reconnect", side = "controller"),
        );

        let supervisor = Supervisor {
            link: Arc::clone(&link),
            slot: Arc::clone(&slot),
            manager: manager.clone(),
            channel: Arc::clone(&channel),
            address,
            connect_timeout,
        };
        let outcome = tokio::select! {
            _ = self.token.cancelled() => Ok(()),
            result = supervisor.supervise(&mut reconnect_events, self.queued.clone()) => result,
        };

        manager.cancel();
        if let Some(handle) = slot.lock().await.take() {
            handle.close().await;
        }
        if let Some(sync) = channel.clipboard() {
            sync.monitor.stop();
        }
        session_token.cancel();
        let _ = runner.await;
        let _ = sweeper.await;
        drop(supervisor);
        drop(channel);
        let _ = events.await;

        info!("controller service stopped");
        outcome
    }
}

// ── Supervisor ───────────────────────────────────────────────────

/// Drives the link through its phases.
struct Supervisor {
    link: Arc<Link>,
    /// The live attachment. The reconnector fills it in.
    slot: Arc<Mutex<Option<LinkHandle>>>,
    manager: ReconnectionManager,
    channel: Arc<ControlChannel>,
    address: String,
    connect_timeout: Duration,
}

impl Supervisor {
    async fn supervise(
        &self,
        events: &mut mpsc::UnboundedReceiver<ReconnectEvent>,
        queued: Queued,
    ) -> Result<(), RelayError> {
        let mut phase = LinkPhase::default();
        let mut queued = Some(queued);

        phase.begin_connect()?;
        match dial(&self.address, self.connect_timeout).await {
            Ok(stream) => {
                *self.slot.lock().await = Some(self.link.attach(stream));
                phase.complete_connect()?;
                info!("connected to {}", self.address);
                self.start_queued(&mut queued);
            }
            Err(e) => {
                warn!("connect to {} failed: {e}", self.address);
                phase.begin_reconnect()?;
                self.manager.start();
            }
        }

        loop {
            if phase.is_connected() {
                self.wait_for_loss().await;
                warn!(
                    "link to {} lost after {:?}",
                    self.address,
                    phase.connected_duration().unwrap_or_default()
                );
                phase.begin_reconnect()?;
                self.manager.start();
                continue;
            }

            let Some(event) = events.recv().await else {
                return Err(RelayError::ChannelClosed);
            };
            match event {
                ReconnectEvent::Reconnecting {
                    attempt,
                    max_attempts,
                    delay,
                } => {
                    phase.record_attempt(attempt)?;
                    info!("reconnecting in {delay:?} (attempt {attempt}/{max_attempts})");
                }
                ReconnectEvent::Reconnected => {
                    phase.complete_connect()?;
                    info!("reconnected to {}", self.address);
                    self.start_queued(&mut queued);
                }
                ReconnectEvent::Failed { attempts } => {
                    phase.give_up()?;
                    error!("giving up on {} after {attempts} attempts", self.address);
                    return Err(RelayError::ReconnectExhausted(attempts));
                }
                ReconnectEvent::Cancelled => {
                    phase.force_disconnect();
                    info!("reconnection cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// Wait for the current attachment to end, then tear it down.
    async fn wait_for_loss(&self) {
        {
            let slot = self.slot.lock().await;
            if let Some(handle) = slot.as_ref() {
                handle.closed().await;
            }
        }
        if let Some(handle) = self.slot.lock().await.take() {
            handle.close().await;
        }
    }

    /// Send the queued requests and uploads in the background, once.
    fn start_queued(&self, queued: &mut Option<Queued>) {
        let Some(Queued { uploads, fetches }) = queued.take() else {
            return;
        };
        if uploads.is_empty() && fetches.is_empty() {
            return;
        }
        let transfers = Arc::clone(self.channel.transfers());
        tokio::spawn(async move {
            for path in fetches {
                if let Err(e) = transfers.request_file(&path).await {
                    error!("request for {path} failed: {e}");
                }
            }
            for path in uploads {
                match transfers.send_file(&path).await {
                    Ok(id) => info!(%id, "uploading {}", path.display()),
                    Err(e) => error!("upload of {} failed: {e}", path.display()),
                }
            }
        });
    }
}

/// Log transfer progress until the engine goes away.
async fn log_transfer_events(mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Sent { id, bytes, chunks } => info!(%id, bytes, chunks, "upload sent"),
            TransferEvent::Acknowledged { id } => info!(%id, "upload acknowledged by agent"),
            TransferEvent::Failed { id, error } => warn!(%id, "transfer failed: {error}"),
            TransferEvent::Started { id, filename, size } => {
                info!(%id, size, "receiving {filename}")
            }
            TransferEvent::Progress { id, percent, .. } => info!(%id, "received {percent}%"),
            TransferEvent::Completed { id, path, bytes } => {
                info!(%id, bytes, "saved {}", path.display())
            }
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
