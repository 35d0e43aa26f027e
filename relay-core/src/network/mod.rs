//! Transport contract and the stream-backed link adapter.

pub mod link;
pub mod transport;

pub use link::{DEFAULT_QUEUE_DEPTH, Link, LinkHandle};
pub use transport::{ChannelTransport, Transport};
