//! Stream-backed link with queues that outlive individual connections.
//!
//! A [`Link`] owns one outbound and one inbound frame queue. Each time a
//! byte stream is (re)established it is [`attach`](Link::attach)ed: a
//! writer task drains the outbound queue into the framed stream and a
//! reader task pushes decoded frames into the inbound queue. When the
//! stream dies both tasks stop and the [`LinkHandle`] reports it, while
//! the queues stay alive for the next attach.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::codec::frame_codec;
use crate::network::transport::ChannelTransport;

/// Default depth of the inbound and outbound queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Persistent frame queues plus the ability to bind them to a stream.
#[derive(Debug)]
pub struct Link {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    max_frame: usize,
}

impl Link {
    /// Create a link and the receiver of its inbound queue.
    pub fn new(max_frame: usize, queue_depth: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_depth);
        let link = Self {
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            inbound_tx,
            max_frame,
        };
        (link, inbound_rx)
    }

    /// A transport that queues onto this link's outbound side.
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport::new(self.outbound_tx.clone())
    }

    /// Bind a freshly established stream to the link.
    ///
    /// A previous attachment must be closed first; the new writer waits
    /// until the old one has released the outbound queue.
    pub fn attach<S>(&self, stream: S) -> LinkHandle
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, frame_codec(self.max_frame)).split();
        let token = CancellationToken::new();

        // Writer task: outbound queue -> network
        let outbound = Arc::clone(&self.outbound_rx);
        let writer_token = token.clone();
        let writer = tokio::spawn(
            async move {
                let mut rx = tokio::select! {
                    _ = writer_token.cancelled() => return,
                    rx = outbound.lock() => rx,
                };
                loop {
                    tokio::select! {
                        _ = writer_token.cancelled() => break,
                        frame = rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = sink.send(Bytes::from(frame)).await {
                                    warn!("network write error: {e}");
                                    break;
                                }
                            }
                            // every transport handle was dropped
                            None => break,
                        },
                    }
                }
                writer_token.cancel();
            }
            .instrument(info_span!("link_writer")),
        );

        // Reader task: network -> inbound queue
        let inbound = self.inbound_tx.clone();
        let reader_token = token.clone();
        let reader = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = reader_token.cancelled() => break,
                        next = frames.next() => match next {
                            Some(Ok(frame)) => {
                                if inbound.send(frame.to_vec()).await.is_err() {
                                    // inbound receiver was dropped, stop reading
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!("network read error: {e}");
                                break;
                            }
                            None => {
                                debug!("peer closed the stream");
                                break;
                            }
                        },
                    }
                }
                reader_token.cancel();
            }
            .instrument(info_span!("link_reader")),
        );

        LinkHandle {
            token,
            reader,
            writer,
        }
    }
}

/// Observes and controls one attachment of a [`Link`].
#[derive(Debug)]
pub struct LinkHandle {
    token: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LinkHandle {
    /// Resolves once the attached stream is lost or closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Whether the attachment has ended.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tear the attachment down and wait for both tasks to finish.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Transport;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, _left_in) = Link::new(1024, 16);
        let (right, mut right_in) = Link::new(1024, 16);
        let _h1 = left.attach(a);
        let _h2 = right.attach(b);

        left.transport().send(b"one".to_vec()).await.unwrap();
        left.transport().send(b"two".to_vec()).await.unwrap();

        assert_eq!(right_in.recv().await.unwrap(), b"one");
        assert_eq!(right_in.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn peer_drop_closes_handle() {
        let (a, b) = tokio::io::duplex(1024);
        let (link, _inbound) = Link::new(1024, 16);
        let handle = link.attach(a);
        drop(b);
        tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .expect("link should close when the peer goes away");
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn queued_frames_survive_reattach() {
        let (link, _inbound) = Link::new(1024, 16);
        let transport = link.transport();

        let (a, b) = tokio::io::duplex(1024);
        let first = link.attach(a);
        drop(b);
        first.closed().await;
        first.close().await;

        // queued while disconnected
        transport.send(b"late".to_vec()).await.unwrap();

        let (c, d) = tokio::io::duplex(1024);
        let _second = link.attach(c);
        let (peer, mut peer_in) = Link::new(1024, 16);
        let _peer_handle = peer.attach(d);

        let frame = tokio::time::timeout(Duration::from_secs(5), peer_in.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"late");
    }
}
