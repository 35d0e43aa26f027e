//! The `send(bytes)` half of the transport contract.
//!
//! Inbound delivery is push-based: whoever owns the transport hands
//! received frames to [`ControlChannel::handle_incoming`].
//!
//! [`ControlChannel::handle_incoming`]: crate::channel::ControlChannel::handle_incoming

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::protocol::Envelope;

/// An opaque, ordered, outbound message channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one frame for delivery. Frames are delivered in call order.
    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError>;

    /// Encode and send one envelope.
    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let frame = envelope.to_bytes()?;
        self.send(frame).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        (**self).send(frame).await
    }
}

/// Transport backed by a bounded mpsc queue.
///
/// A full queue applies backpressure to the caller; a dropped receiver
/// turns every send into [`RelayError::ChannelClosed`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Create a transport together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        self.tx.send(frame).await.map_err(RelayError::from)
    }
}
