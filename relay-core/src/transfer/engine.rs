//! Transfer engine: the session table plus the sending side.
//!
//! Inbound envelopes are applied in arrival order. The table lock is a
//! plain `std::sync::Mutex` held only for lookups and inserts; every file
//! write happens under the session's own async lock, so unrelated
//! transfers progress independently. Each open session owns its
//! destination path until it completes or fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex as SessionLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::error::RelayError;
use crate::network::Transport;
use crate::protocol::Envelope;
use crate::protocol::file::{TRANSFER_ID_PREFIX, compute_total_chunks};
use crate::transfer::session::TransferSession;
use crate::transfer::{TransferConfig, TransferEvent};

type SharedSession = Arc<SessionLock<TransferSession>>;

struct Slot {
    path: PathBuf,
    session: SharedSession,
}

type SessionTable = HashMap<String, Slot>;

/// Sends files to the peer and reassembles files the peer sends.
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    sessions: Mutex<SessionTable>,
    /// Uploads awaiting the peer's echoed `file_transfer_complete`.
    outgoing: Mutex<HashMap<String, PathBuf>>,
    last_id: AtomicU64,
    events: mpsc::UnboundedSender<TransferEvent>,
    span: Span,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("sessions", &self.active_sessions())
            .finish()
    }
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        Self::with_span(transport, config, info_span!("transfer"))
    }

    pub fn with_span(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        span: Span,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            transport,
            config,
            sessions: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            last_id: AtomicU64::new(0),
            events,
            span,
        };
        (engine, rx)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Number of inbound sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    /// Number of uploads still waiting for the peer's acknowledgment.
    pub fn pending_uploads(&self) -> usize {
        self.outgoing().len()
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one transfer envelope.
    pub async fn handle(&self, envelope: Envelope) -> Result<(), RelayError> {
        let span = self.span.clone();
        async move {
            match envelope {
                Envelope::FileTransferStart { id, filename, size } => {
                    self.on_start(&id, &filename, size).await
                }
                Envelope::FileChunk { id, offset, data } => {
                    self.on_chunk(&id, offset, &data).await
                }
                Envelope::FileTransferComplete { id } => self.on_complete(&id).await,
                Envelope::FileTransferError { id, error } => {
                    self.on_error(&id, &error).await;
                    Ok(())
                }
                Envelope::RequestFile { path } => self.on_request(&path).await,
                other => Err(RelayError::Other(format!(
                    "{} is not a transfer envelope",
                    other.kind()
                ))),
            }
        }
        .instrument(span)
        .await
    }

    /// `file_transfer_start`: create the destination file and register a session.
    pub async fn on_start(&self, id: &str, filename: &str, size: u64) -> Result<(), RelayError> {
        let Some(name) = sanitize_filename(filename) else {
            let err = RelayError::InvalidFilename(filename.to_string());
            warn!(id, "rejecting transfer: {err}");
            return self.reject(id, err).await;
        };
        if self.has_session(id) {
            let err = RelayError::Other(format!("duplicate transfer id {id}"));
            warn!(id, "rejecting transfer: {err}");
            return self.reject(id, err).await;
        }

        let path = self.config.download_dir.join(name);
        if let Some(owner) = self.owner_of(&path) {
            let err = RelayError::DestinationBusy {
                path: name.to_string(),
                owner,
            };
            warn!(id, "rejecting transfer: {err}");
            return self.reject(id, err).await;
        }

        let session = match self.open_session(id, name, &path, size).await {
            Ok(session) => session,
            Err(e) => {
                warn!(id, path = %path.display(), "failed to create destination file: {e}");
                return self.reject(id, e).await;
            }
        };

        let slot = Slot {
            path,
            session: Arc::new(SessionLock::new(session)),
        };
        self.sessions().insert(id.to_string(), slot);
        info!(id, filename = name, size, "receiving file");
        self.emit(TransferEvent::Started {
            id: id.to_string(),
            filename: name.to_string(),
            size,
        });
        Ok(())
    }

    async fn open_session(
        &self,
        id: &str,
        name: &str,
        path: &Path,
        size: u64,
    ) -> Result<TransferSession, RelayError> {
        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        TransferSession::create(id, name, path.to_path_buf(), size).await
    }

    /// `file_chunk`: append to the session's file.
    pub async fn on_chunk(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), RelayError> {
        let found = self.sessions().get(id).map(|slot| Arc::clone(&slot.session));
        let Some(session) = found else {
            warn!(id, "chunk for unknown transfer");
            return self.reject(id, RelayError::TransferNotFound(id.to_string())).await;
        };

        let mut session = session.lock().await;
        if offset != session.bytes_received() {
            warn!(
                id,
                offset,
                received = session.bytes_received(),
                "chunk offset does not match bytes received"
            );
        }

        match session.append(data).await {
            Ok(Some(percent)) => {
                info!(
                    id,
                    percent,
                    received = session.bytes_received(),
                    expected = session.expected_size(),
                    "transfer progress"
                );
                self.emit(TransferEvent::Progress {
                    id: id.to_string(),
                    percent,
                    bytes_received: session.bytes_received(),
                    expected_size: session.expected_size(),
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(id, "failed to write chunk: {e}");
                self.sessions().remove(id);
                session.discard().await;
                drop(session);
                self.reject(id, e).await
            }
        }
    }

    /// `file_transfer_complete`: finalize an inbound session and acknowledge
    /// it, or accept the peer's acknowledgment of one of our uploads.
    pub async fn on_complete(&self, id: &str) -> Result<(), RelayError> {
        let removed = self.sessions().remove(id).map(|slot| slot.session);
        let Some(session) = removed else {
            if self.outgoing().remove(id).is_some() {
                info!(id, "upload acknowledged by peer");
                self.emit(TransferEvent::Acknowledged { id: id.to_string() });
                return Ok(());
            }
            warn!(id, "completion for unknown transfer");
            return self.reject(id, RelayError::TransferNotFound(id.to_string())).await;
        };

        let mut session = session.lock().await;
        let expected = session.expected_size();
        let received = session.bytes_received();
        if self.config.verify_size && received != expected {
            let err = RelayError::SizeMismatch {
                id: id.to_string(),
                expected,
                received,
            };
            warn!(id, "{err}");
            session.discard().await;
            return self.reject(id, err).await;
        }

        if let Err(e) = session.finish().await {
            warn!(id, "failed to close destination file: {e}");
            session.discard().await;
            return self.reject(id, e).await;
        }
        let path = session.path().to_path_buf();
        drop(session);

        info!(id, path = %path.display(), bytes = received, "file received");
        self.emit(TransferEvent::Completed {
            id: id.to_string(),
            path,
            bytes: received,
        });
        self.transport
            .send_envelope(&Envelope::FileTransferComplete { id: id.to_string() })
            .await
    }

    /// `file_transfer_error`: drop whatever this id refers to. Never echoed.
    pub async fn on_error(&self, id: &str, error: &str) {
        let removed = self.sessions().remove(id).map(|slot| slot.session);
        if let Some(session) = removed {
            let mut session = session.lock().await;
            warn!(id, filename = session.filename(), "transfer aborted by peer: {error}");
            session.discard().await;
            self.emit(TransferEvent::Failed {
                id: id.to_string(),
                error: error.to_string(),
            });
        } else if self.outgoing().remove(id).is_some() {
            warn!(id, "upload rejected by peer: {error}");
            self.emit(TransferEvent::Failed {
                id: id.to_string(),
                error: error.to_string(),
            });
        } else {
            debug!(id, "error for unknown transfer ignored: {error}");
        }
    }

    /// `request_file`: upload a file from the shared directory to the peer.
    ///
    /// A request that cannot be served is answered with `file_transfer_error`
    /// whose id is the requested path, since no transfer id exists yet.
    pub async fn on_request(&self, requested: &str) -> Result<(), RelayError> {
        let path = match self.resolve_shared(requested).await {
            Ok(path) => path,
            Err(e) => {
                warn!(path = requested, "refusing file request: {e}");
                return self.reject(requested, e).await;
            }
        };
        info!(path = %path.display(), "file requested by peer");
        self.upload(&path).await.map(|_| ())
    }

    /// Map a peer-supplied path onto a regular file under `share_dir`.
    async fn resolve_shared(&self, requested: &str) -> Result<PathBuf, RelayError> {
        let refuse = |reason| RelayError::RequestRefused {
            path: requested.to_string(),
            reason,
        };
        let Some(root) = &self.config.share_dir else {
            return Err(refuse("file requests are disabled"));
        };
        if requested.trim().is_empty() {
            return Err(refuse("no path given"));
        }

        let root = tokio::fs::canonicalize(root).await?;
        let path = tokio::fs::canonicalize(root.join(requested)).await?;
        if !path.starts_with(&root) {
            return Err(refuse("outside the shared directory"));
        }
        if !tokio::fs::metadata(&path).await?.is_file() {
            return Err(refuse("not a regular file"));
        }
        Ok(path)
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Ask the peer to upload `path`, relative to its shared directory.
    /// The file arrives as an ordinary inbound transfer.
    pub async fn request_file(&self, path: &str) -> Result<(), RelayError> {
        info!(parent: &self.span, path, "requesting file from peer");
        self.transport
            .send_envelope(&Envelope::RequestFile {
                path: path.to_string(),
            })
            .await
    }

    /// Upload a local file. Returns the transfer id once every envelope has
    /// been handed to the transport; the acknowledgment arrives later as
    /// [`TransferEvent::Acknowledged`].
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<String, RelayError> {
        let path = path.as_ref();
        let span = self.span.clone();
        self.upload(path).instrument(span).await
    }

    async fn upload(&self, path: &Path) -> Result<String, RelayError> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RelayError::InvalidFilename(path.display().to_string()))?;

        let id = self.next_transfer_id();
        let chunks = compute_total_chunks(size, self.config.chunk_size);
        info!(id, filename, size, chunks, "sending file");
        self.outgoing().insert(id.clone(), path.to_path_buf());

        let start = Envelope::FileTransferStart {
            id: id.clone(),
            filename,
            size,
        };
        if let Err(e) = self.transport.send_envelope(&start).await {
            self.outgoing().remove(&id);
            warn!(id, "failed to announce transfer: {e}");
            self.emit(TransferEvent::Failed {
                id,
                error: e.to_string(),
            });
            return Err(e);
        }

        match self.stream_chunks(&id, &mut file).await {
            Ok((bytes, chunks)) => {
                info!(id, bytes, chunks, "file sent");
                self.emit(TransferEvent::Sent {
                    id: id.clone(),
                    bytes,
                    chunks,
                });
                Ok(id)
            }
            Err(e) => {
                warn!(id, "upload aborted: {e}");
                self.outgoing().remove(&id);
                self.notify_peer(&id, &e).await;
                self.emit(TransferEvent::Failed {
                    id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn stream_chunks(&self, id: &str, file: &mut File) -> Result<(u64, u64), RelayError> {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut offset = 0u64;
        let mut chunks = 0u64;

        loop {
            let n = read_full(file, &mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = Envelope::FileChunk {
                id: id.to_string(),
                offset,
                data: buf[..n].to_vec(),
            };
            self.transport.send_envelope(&chunk).await?;
            offset += n as u64;
            chunks += 1;
            if n < buf.len() {
                break;
            }
        }

        self.transport
            .send_envelope(&Envelope::FileTransferComplete { id: id.to_string() })
            .await?;
        Ok((offset, chunks))
    }

    /// `upload_<nanos>`, strictly increasing even if the clock stalls.
    fn next_transfer_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
            .unwrap_or_default();
        let previous = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        let nanos = now.max(previous.saturating_add(1));
        format!("{TRANSFER_ID_PREFIX}{nanos}")
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Fail every inbound session that has been idle longer than the
    /// configured timeout. Returns how many were failed.
    pub async fn sweep_idle(&self) -> usize {
        let Some(timeout) = self.config.idle_timeout else {
            return 0;
        };
        let now = Instant::now();

        let snapshot: Vec<(String, SharedSession)> = self
            .sessions()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(&slot.session)))
            .collect();

        let mut swept = 0;
        for (id, session) in snapshot {
            // a locked session is being written right now
            let Ok(mut guard) = session.try_lock() else {
                continue;
            };
            let idle = guard.idle_for(now);
            if idle <= timeout {
                continue;
            }
            {
                let mut table = self.sessions();
                match table.get(&id) {
                    Some(current) if Arc::ptr_eq(&current.session, &session) => {
                        table.remove(&id);
                    }
                    _ => continue,
                }
            }

            let err = RelayError::TransferIdle {
                id: id.clone(),
                idle,
            };
            warn!(parent: &self.span, id, "{err}");
            guard.discard().await;
            drop(guard);
            self.notify_peer(&id, &err).await;
            self.emit(TransferEvent::Failed {
                id,
                error: err.to_string(),
            });
            swept += 1;
        }
        swept
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until
    /// `token` is cancelled.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(engine.config.sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let swept = engine.sweep_idle().await;
                            if swept > 0 {
                                debug!(swept, "idle transfers removed");
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Close and discard every open session and forget pending uploads.
    /// Returns the number of inbound sessions closed.
    pub async fn cleanup(&self) -> usize {
        let sessions = std::mem::take(&mut *self.sessions());
        self.outgoing().clear();

        let closed = sessions.len();
        for (id, slot) in sessions {
            slot.session.lock().await.discard().await;
            self.emit(TransferEvent::Failed {
                id,
                error: "transfer closed during cleanup".to_string(),
            });
        }
        if closed > 0 {
            info!(parent: &self.span, closed, "open transfers discarded");
        }
        closed
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outgoing(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The id of the open session writing to `path`, if any.
    fn owner_of(&self, path: &Path) -> Option<String> {
        self.sessions()
            .iter()
            .find(|(_, slot)| slot.path == path)
            .map(|(id, _)| id.clone())
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn notify_peer(&self, id: &str, err: &RelayError) {
        let envelope = Envelope::transfer_error(id, err.peer_message());
        if let Err(e) = self.transport.send_envelope(&envelope).await {
            warn!(id, "failed to report transfer error to peer: {e}");
        }
    }

    /// Tell the peer, publish `Failed`, and hand the error back.
    async fn reject(&self, id: &str, err: RelayError) -> Result<(), RelayError> {
        self.notify_peer(id, &err).await;
        self.emit(TransferEvent::Failed {
            id: id.to_string(),
            error: err.to_string(),
        });
        Err(err)
    }
}

/// Reduce a peer-supplied name to a bare file name.
fn sanitize_filename(name: &str) -> Option<&str> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    match last {
        "" | "." | ".." => None,
        _ => Some(last),
    }
}

/// Fill `buf` unless the file ends first. Returns the bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
