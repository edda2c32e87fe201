/*!
In-memory link for development without a broker or a paired watch.

Records every frame sent, lets tests push inbound frames, and can be told to
refuse connections, stall, or hang individual nodes.
*/

use super::{InboundFrame, LinkError, LinkEvent, LinkFuture, NodeSource, OutboundFrame, TransportLink};
use crate::codec::{self, MessageEnvelope};
use crate::models::RemoteNode;
use crate::state::{new_state, Shared};
use crate::topics::Topic;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct MemoryLinkState {
    connected: bool,
    session: u64,
    connect_attempts: usize,
    disconnects: usize,
    connect_failure: Option<String>,
    connect_hangs: bool,
    connect_delay: Duration,
    sent: Vec<OutboundFrame>,
    nodes: Vec<RemoteNode>,
    hanging_nodes: HashSet<String>,
    failing_nodes: HashSet<String>,
    directory_hangs: bool,
    directory_fault: Option<String>,
    inbound: Option<mpsc::Sender<LinkEvent>>,
}

/// Fake link simulating a broker / wearable message client.
#[derive(Clone, Default)]
pub struct MemoryLink {
    state: Shared<MemoryLinkState>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self { state: new_state(MemoryLinkState::default()) }
    }

    /// Channel on which simulated inbound events are delivered.
    pub fn setup_receiver(&self, capacity: usize) -> mpsc::Receiver<LinkEvent> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.state.lock().inbound = Some(sender);
        receiver
    }

    // ---- fault injection ----

    /// `Some(reason)` makes every following connect fail; `None` restores it.
    pub fn fail_connect(&self, reason: Option<&str>) {
        self.state.lock().connect_failure = reason.map(str::to_string);
    }

    pub fn hang_connect(&self, hang: bool) {
        self.state.lock().connect_hangs = hang;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_nodes(&self, nodes: Vec<RemoteNode>) {
        self.state.lock().nodes = nodes;
    }

    pub fn add_node(&self, node_id: &str, display_name: &str) {
        self.state.lock().nodes.push(RemoteNode::new(node_id, display_name));
    }

    /// Sends to this node never complete.
    pub fn hang_node(&self, node_id: &str) {
        self.state.lock().hanging_nodes.insert(node_id.to_string());
    }

    /// Sends to this node fail immediately.
    pub fn fail_node(&self, node_id: &str) {
        self.state.lock().failing_nodes.insert(node_id.to_string());
    }

    pub fn hang_directory(&self, hang: bool) {
        self.state.lock().directory_hangs = hang;
    }

    pub fn fail_directory(&self, reason: Option<&str>) {
        self.state.lock().directory_fault = reason.map(str::to_string);
    }

    // ---- inbound simulation ----

    pub fn simulate_incoming(&self, node_id: &str, topic: Topic, bytes: Vec<u8>) -> Result<(), LinkError> {
        let frame = InboundFrame { node_id: node_id.to_string(), topic, bytes };
        debug!("[memory-link] simulated incoming on {} from {}", topic, node_id);
        self.push_event(LinkEvent::Message(frame))
    }

    pub fn simulate_envelope(&self, node_id: &str, envelope: &MessageEnvelope) -> Result<(), LinkError> {
        let bytes = codec::encode(envelope).map_err(|e| LinkError::Broker(e.to_string()))?;
        self.simulate_incoming(node_id, envelope.topic(), bytes)
    }

    /// Drops the connection as a broker outage would.
    pub fn simulate_drop(&self, reason: &str) -> Result<(), LinkError> {
        let session = {
            let mut state = self.state.lock();
            state.connected = false;
            state.session
        };
        self.push_event(LinkEvent::Dropped { session, cause: reason.to_string() })
    }

    fn push_event(&self, event: LinkEvent) -> Result<(), LinkError> {
        let sender = self.state.lock().inbound.clone();
        match sender {
            Some(sender) => sender.try_send(event).map_err(|_| LinkError::Closed),
            None => Err(LinkError::Closed),
        }
    }

    // ---- assertions ----

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.state.lock().sent.clone()
    }

    pub fn frames_to(&self, node_id: &str) -> Vec<OutboundFrame> {
        self.state.lock().sent.iter().filter(|f| f.node_id == node_id).cloned().collect()
    }

    pub fn frames_on(&self, topic: Topic) -> Vec<OutboundFrame> {
        self.state.lock().sent.iter().filter(|f| f.topic == topic).cloned().collect()
    }

    /// Decodes every frame recorded on a topic, skipping undecodable ones.
    pub fn envelopes_on(&self, topic: Topic) -> Vec<MessageEnvelope> {
        self.frames_on(topic).iter().filter_map(|f| codec::decode(&f.bytes).ok()).collect()
    }

    pub fn clear(&self) {
        self.state.lock().sent.clear();
    }
}

impl TransportLink for MemoryLink {
    fn connect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let (delay, failure, hangs) = {
                let mut state = self.state.lock();
                state.connect_attempts += 1;
                (state.connect_delay, state.connect_failure.clone(), state.connect_hangs)
            };
            if hangs {
                std::future::pending::<()>().await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = failure {
                return Err(LinkError::Refused(reason));
            }
            let session = {
                let mut state = self.state.lock();
                state.connected = true;
                state.session += 1;
                state.session
            };
            debug!("[memory-link] connected (session {})", session);
            Ok(())
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.connected = false;
            state.disconnects += 1;
            Ok(())
        })
    }

    fn send(&self, frame: OutboundFrame) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let hangs = {
                let state = self.state.lock();
                if !state.connected {
                    return Err(LinkError::NotConnected);
                }
                if state.failing_nodes.contains(&frame.node_id) {
                    return Err(LinkError::NodeUnreachable(frame.node_id.clone()));
                }
                state.hanging_nodes.contains(&frame.node_id)
            };
            if hangs {
                std::future::pending::<()>().await;
            }
            debug!("[memory-link] sent {} bytes to {} on {}", frame.bytes.len(), frame.node_id, frame.topic);
            self.state.lock().sent.push(frame);
            Ok(())
        })
    }

    fn session(&self) -> u64 {
        self.state.lock().session
    }
}

impl NodeSource for MemoryLink {
    fn connected_nodes(&self) -> LinkFuture<'_, Vec<RemoteNode>> {
        Box::pin(async move {
            let (hangs, fault, nodes) = {
                let state = self.state.lock();
                (state.directory_hangs, state.directory_fault.clone(), state.nodes.clone())
            };
            if hangs {
                std::future::pending::<()>().await;
            }
            match fault {
                Some(reason) => Err(LinkError::Broker(reason)),
                None => Ok(nodes),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let link = MemoryLink::new();
        let frame = OutboundFrame { node_id: "watch".into(), topic: Topic::Control, bytes: b"{}".to_vec() };
        assert_eq!(link.send(frame.clone()).await, Err(LinkError::NotConnected));

        link.connect().await.unwrap();
        link.send(frame).await.unwrap();
        assert_eq!(link.frames_to("watch").len(), 1);
        assert_eq!(link.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_simulated_incoming_reaches_receiver() {
        let link = MemoryLink::new();
        let mut rx = link.setup_receiver(4);
        link.simulate_incoming("watch", Topic::SensorData, b"hello".to_vec()).unwrap();

        match rx.recv().await {
            Some(LinkEvent::Message(frame)) => {
                assert_eq!(frame.node_id, "watch");
                assert_eq!(frame.bytes, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_node_and_refused_connect() {
        let link = MemoryLink::new();
        link.fail_connect(Some("broker down"));
        assert!(matches!(link.connect().await, Err(LinkError::Refused(_))));
        assert!(!link.is_connected());

        link.fail_connect(None);
        link.connect().await.unwrap();
        link.fail_node("watch");
        let frame = OutboundFrame { node_id: "watch".into(), topic: Topic::DangerAlert, bytes: vec![] };
        assert!(matches!(link.send(frame).await, Err(LinkError::NodeUnreachable(_))));
        assert!(link.sent_frames().is_empty());
    }
}
