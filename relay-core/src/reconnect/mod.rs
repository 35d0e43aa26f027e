//! Automatic reconnection with exponential backoff.
//!
//! The [`ReconnectionManager`] wraps whatever re-establishes the transport.
//! It runs at most one retry loop at a time and reports progress as
//! [`ReconnectEvent`]s on a channel the caller drains.

pub mod backoff;
pub mod manager;

pub use backoff::BackoffPolicy;
pub use manager::{ReconnectConfig, ReconnectEvent, ReconnectionManager, Reconnector};
