/*!
 * TRANSPORT LINK - Byte-message channel to named remote nodes
 *
 * ROLE :
 * Hides the concrete transport (MQTT broker, wearable message client, test fake)
 * behind connect / disconnect / send. Inbound traffic does not go through the
 * trait: every link hands out a bounded `mpsc::Receiver<LinkEvent>` when it is
 * built, and the relay owns the receive loop.
 *
 * IMPLEMENTATIONS :
 * - `MqttLink`   : production link over rumqttc, with retained presence records
 * - `MemoryLink` : in-process fake with fault, hang and latency injection
 */

pub mod memory;
pub mod mqtt;

use crate::models::RemoteNode;
use crate::topics::Topic;
use std::future::Future;
use std::pin::Pin;

pub use memory::MemoryLink;
pub use mqtt::MqttLink;

/// Boxed future returned by link operations, so links can live behind `Arc<dyn ...>`.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("link closed")]
    Closed,
}

/// Bytes addressed to one node on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub node_id: String,
    pub topic: Topic,
    pub bytes: Vec<u8>,
}

/// Bytes received from one node on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub node_id: String,
    pub topic: Topic,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(InboundFrame),
    /// The transport lost the connection of session `session` without being
    /// asked to.
    Dropped { session: u64, cause: String },
}

pub trait TransportLink: Send + Sync {
    fn connect(&self) -> LinkFuture<'_, ()>;

    fn disconnect(&self) -> LinkFuture<'_, ()>;

    fn send(&self, frame: OutboundFrame) -> LinkFuture<'_, ()>;

    /// Id of the current transport session, bumped by every connect.
    fn session(&self) -> u64;
}

/// Source of currently paired devices (wearable node client, MQTT presence...).
pub trait NodeSource: Send + Sync {
    fn connected_nodes(&self) -> LinkFuture<'_, Vec<RemoteNode>>;
}
