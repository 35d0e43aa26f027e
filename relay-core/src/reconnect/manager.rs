//! The reconnection state machine.
//!
//! ```text
//!            start()                       reconnect() == Ok
//!  Idle ───────────────► Waiting ──sleep──► Dialing ─────────────► Idle  (Reconnected)
//!   ▲                      ▲   │               │
//!   │                      │   │ cancel()      │ Err
//!   │                      │   ▼               │
//!   │ attempt > max        └── next attempt ◄──┘
//!   └──────────── (Failed)       Idle (Cancelled)
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::error::RelayError;
use crate::reconnect::backoff::BackoffPolicy;

// ── Configuration ────────────────────────────────────────────────

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts before giving up and reporting [`ReconnectEvent::Failed`].
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Progress notifications published by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// About to wait `delay` and then make attempt `attempt`.
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// The reconnector succeeded; the loop has ended.
    Reconnected,
    /// The retry budget is exhausted; a new `start()` is required.
    Failed { attempts: u32 },
    /// The loop stopped because of `cancel()`.
    Cancelled,
}

// ── Reconnector ──────────────────────────────────────────────────

/// Re-establishes the transport. One call is one attempt.
#[async_trait]
pub trait Reconnector: Send + Sync + 'static {
    async fn reconnect(&self) -> Result<(), RelayError>;
}

#[async_trait]
impl<F, Fut> Reconnector for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    async fn reconnect(&self) -> Result<(), RelayError> {
        (self)().await
    }
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReconnectionState {
    attempt: u32,
    active: bool,
    /// Bumped by every `start()`; a loop only touches state it owns.
    run_id: u64,
    cancel: CancellationToken,
}

struct Inner {
    config: ReconnectConfig,
    state: Mutex<ReconnectionState>,
    reconnector: Arc<dyn Reconnector>,
    events: mpsc::UnboundedSender<ReconnectEvent>,
    span: Span,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ReconnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ReconnectEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Reset state if `run_id` still owns it.
    fn finish(&self, run_id: u64) {
        let mut state = self.state();
        if state.run_id == run_id {
            state.active = false;
            state.attempt = 0;
        }
    }
}

// ── ReconnectionManager ──────────────────────────────────────────

/// Runs the retry loop that re-establishes a lost transport.
///
/// Cheap to clone; all clones drive the same loop.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReconnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionManager")
            .field("config", &self.inner.config)
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

impl ReconnectionManager {
    /// Create a manager and the receiver of its events.
    pub fn new<R: Reconnector>(
        config: ReconnectConfig,
        reconnector: R,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        Self::with_span(config, reconnector, info_span!("reconnect"))
    }

    /// Like [`new`](Self::new), logging under the given span.
    pub fn with_span<R: Reconnector>(
        config: ReconnectConfig,
        reconnector: R,
        span: Span,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            state: Mutex::new(ReconnectionState::default()),
            reconnector: Arc::new(reconnector),
            events,
            span,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Launch the retry loop unless one is already running.
    ///
    /// Returns `false` when a loop was already active. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) -> bool {
        let (run_id, token) = {
            let mut state = self.inner.state();
            if state.active {
                debug!(parent: &self.inner.span, "reconnection already in progress");
                return false;
            }
            state.active = true;
            state.attempt = 0;
            state.run_id += 1;
            state.cancel = CancellationToken::new();
            (state.run_id, state.cancel.clone())
        };

        let inner = Arc::clone(&self.inner);
        let span = self.inner.span.clone();
        tokio::spawn(reconnection_loop(inner, run_id, token).instrument(span));
        true
    }

    /// Ask the running loop to stop.
    ///
    /// The loop observes the request before its next wait, during the wait
    /// and right after it. It stays active until it has actually exited, so
    /// `start()` cannot overlap an attempt that is still in flight. Returns
    /// `false` if nothing was running.
    pub fn cancel(&self) -> bool {
        let state = self.inner.state();
        if !state.active {
            return false;
        }
        info!(parent: &self.inner.span, "cancelling reconnection");
        state.cancel.cancel();
        true
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.state().active
    }

    pub fn current_attempt(&self) -> u32 {
        self.inner.state().attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.config.max_retries
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }
}

/// Claim the next attempt number, or `None` when this run was cancelled.
fn next_attempt(inner: &Inner, run_id: u64, token: &CancellationToken) -> Option<u32> {
    let mut state = inner.state();
    if state.run_id != run_id || token.is_cancelled() {
        return None;
    }
    state.attempt += 1;
    Some(state.attempt)
}

async fn reconnection_loop(inner: Arc<Inner>, run_id: u64, token: CancellationToken) {
    let max_attempts = inner.config.max_retries;

    loop {
        let Some(attempt) = next_attempt(&inner, run_id, &token) else {
            info!("reconnection cancelled");
            inner.finish(run_id);
            inner.emit(ReconnectEvent::Cancelled);
            return;
        };

        if attempt > max_attempts {
            warn!("reconnection failed after {max_attempts} attempts");
            inner.finish(run_id);
            inner.emit(ReconnectEvent::Failed {
                attempts: max_attempts,
            });
            return;
        }

        let delay = inner.config.backoff.delay(attempt);
        info!(attempt, max_attempts, ?delay, "reconnection attempt scheduled");
        inner.emit(ReconnectEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        });

        tokio::select! {
            _ = token.cancelled() => {
                info!("reconnection cancelled during wait");
                inner.finish(run_id);
                inner.emit(ReconnectEvent::Cancelled);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if token.is_cancelled() {
            info!("reconnection cancelled during wait");
            inner.finish(run_id);
            inner.emit(ReconnectEvent::Cancelled);
            return;
        }

        let result = inner.reconnector.reconnect().await;
        if token.is_cancelled() {
            info!(attempt, "attempt finished after cancellation; discarding result");
            inner.finish(run_id);
            inner.emit(ReconnectEvent::Cancelled);
            return;
        }

        match result {
            Ok(()) => {
                info!(attempt, "reconnected");
                inner.finish(run_id);
                inner.emit(ReconnectEvent::Reconnected);
                return;
            }
            Err(e) => warn!(attempt, "reconnection attempt failed: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
