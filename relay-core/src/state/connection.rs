//! Link lifecycle state machine for the dialing side.
//!
//! Provides a `LinkPhase` enum that models the controller's view of its
//! connection to the agent, with validated transitions that return
//! `Result` instead of panicking.

use std::time::Instant;

use crate::error::RelayError;

// ── LinkPhase ────────────────────────────────────────────────────

/// The current phase of the controller's link.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲  │             │             │
///       │  │             ▼             ▼
///       │  └──────► Reconnecting ◄─────┘
///       │                │
///       └────────────────┘ (gave up)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// First dial in progress.
    Connecting,

    /// Stream attached; envelopes flow.
    Connected {
        /// When the link entered the `Connected` state.
        since: Instant,
    },

    /// The reconnection loop is running.
    Reconnecting {
        /// Last attempt announced by the reconnection manager.
        attempt: u32,
    },
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting ({attempt})"),
        }
    }
}

impl LinkPhase {
    /// Returns `true` when envelopes can flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Returns `true` when the link is idle.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the link has been in the `Connected` state.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Reconnecting`.
    pub fn complete_connect(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting | Self::Reconnecting { .. } => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot complete connect: not dialing",
            )),
        }
    }

    /// Valid from: `Connecting` (first dial failed), `Connected` (link lost),
    /// `Disconnected`.
    pub fn begin_reconnect(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting | Self::Connected { .. } | Self::Disconnected => {
                *self = Self::Reconnecting { attempt: 0 };
                Ok(())
            }
            Self::Reconnecting { .. } => Err(RelayError::InvalidTransition(
                "already reconnecting",
            )),
        }
    }

    /// Record the attempt number announced by the reconnection loop.
    ///
    /// Valid from: `Reconnecting`.
    pub fn record_attempt(&mut self, attempt: u32) -> Result<(), RelayError> {
        match self {
            Self::Reconnecting { attempt: current } => {
                *current = attempt;
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot record attempt: not reconnecting",
            )),
        }
    }

    /// Valid from: `Connecting`, `Reconnecting`.
    pub fn give_up(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting | Self::Reconnecting { .. } => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(RelayError::InvalidTransition(
                "cannot give up: not dialing",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = LinkPhase::Disconnected;

        phase.begin_connect().unwrap();
        assert_eq!(phase, LinkPhase::Connecting);

        phase.complete_connect().unwrap();
        assert!(phase.is_connected());
        assert!(phase.connected_duration().is_some());

        phase.begin_reconnect().unwrap();
        phase.record_attempt(3).unwrap();
        assert_eq!(phase, LinkPhase::Reconnecting { attempt: 3 });

        phase.complete_connect().unwrap();
        assert!(phase.is_connected());
    }

    #[test]
    fn give_up_after_reconnecting() {
        let mut phase = LinkPhase::Reconnecting { attempt: 10 };
        phase.give_up().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn invalid_transition_connect_when_connected() {
        let mut phase = LinkPhase::Connected {
            since: Instant::now(),
        };
        assert!(phase.begin_connect().is_err());
        assert!(phase.give_up().is_err());
    }

    #[test]
    fn double_reconnect_is_rejected() {
        let mut phase = LinkPhase::Reconnecting { attempt: 1 };
        assert!(phase.begin_reconnect().is_err());
    }

    #[test]
    fn record_attempt_requires_reconnecting() {
        let mut phase = LinkPhase::Connecting;
        assert!(phase.record_attempt(1).is_err());
    }

    #[test]
    fn force_disconnect_from_any_state() {
        let mut phase = LinkPhase::Connected {
            since: Instant::now(),
        };
        phase.force_disconnect();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn display_format() {
        assert_eq!(LinkPhase::Disconnected.to_string(), "Disconnected");
        assert_eq!(LinkPhase::Connecting.to_string(), "Connecting");
        assert_eq!(
            LinkPhase::Reconnecting { attempt: 2 }.to_string(),
            "Reconnecting (2)"
        );
    }

    #[test]
    fn default_phase_is_disconnected() {
        assert!(LinkPhase::default().is_disconnected());
    }
}
