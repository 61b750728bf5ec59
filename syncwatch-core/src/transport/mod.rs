//! Broadcast Transport
//!
//! Fire-and-forget pub/sub per room and logical channel. No ordering or
//! delivery guarantee; a publisher never receives its own messages.

mod gossip;
mod memory;

pub use gossip::{GossipConfig, GossipTransport};
pub use memory::{LoopbackHub, LoopbackTransport, Published};

use futures::stream::BoxStream;
use thiserror::Error;

use crate::sync::Channel;

/// Transport-related errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Failed to create transport: {0}")]
    Setup(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

pub trait BroadcastTransport: Send + Sync {
    /// Send `payload` to every other subscriber of `(room_id, channel)`
    fn publish(&self, room_id: &str, channel: Channel, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Receive payloads from other peers; the stream ends on unsubscribe
    fn subscribe(&self, room_id: &str, channel: Channel) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    fn unsubscribe(&self, room_id: &str, channel: Channel);
}

/// Topic name for one room channel
pub fn topic_name(room_id: &str, channel: Channel) -> String {
    format!("syncwatch-{}-{}", room_id, channel.name())
}
