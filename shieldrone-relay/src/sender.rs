/*!
 * OUTBOUND SENDER - Fail-fast, at-most-once sends
 *
 * Nothing is queued: a send while the link is down fails with `NotConnected`
 * and kicks one background reconnect. The payload is dropped, the caller
 * decides whether to send again later.
 */

use crate::codec::{self, EncodeError, MessageEnvelope, Payload};
use crate::connection::ConnectionManager;
use crate::link::{LinkError, OutboundFrame};
use crate::models::{AssignmentCommand, AudioData, HeartRateData};
use crate::store::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("delivery timed out after {0:?}")]
    DeliveryTimeout(Duration),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Clone)]
pub struct OutboundSender {
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
    upstream: String,
    send_timeout: Duration,
}

impl OutboundSender {
    pub fn new(
        connection: Arc<ConnectionManager>,
        clock: Arc<dyn Clock>,
        upstream: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self { connection, clock, upstream: upstream.into(), send_timeout }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Envelope stamped with the current time.
    pub fn envelope(&self, payload: Payload) -> MessageEnvelope {
        MessageEnvelope::new(payload, self.clock.now_millis())
    }

    /// Sends to the upstream node.
    pub async fn send(&self, payload: Payload) -> Result<(), SendError> {
        let envelope = self.envelope(payload);
        self.send_to(&self.upstream, &envelope).await
    }

    /// Sends one envelope to one node. Any failure except encoding triggers
    /// a reconnect.
    pub async fn send_to(&self, node_id: &str, envelope: &MessageEnvelope) -> Result<(), SendError> {
        if !self.connection.is_connected() {
            warn!("[sender] {} to {} dropped: not connected", envelope.tag(), node_id);
            self.connection.trigger_reconnect();
            return Err(SendError::NotConnected);
        }

        match self.write(node_id, envelope).await {
            Err(e @ (SendError::DeliveryTimeout(_) | SendError::Link(_) | SendError::NotConnected)) => {
                warn!("[sender] {} to {} failed: {}", envelope.tag(), node_id, e);
                self.connection.trigger_reconnect();
                Err(e)
            }
            other => other,
        }
    }

    /// Per-node delivery used by alert fan-out. Reports only, never touches
    /// the connection.
    pub async fn deliver(&self, node_id: &str, envelope: &MessageEnvelope) -> Result<(), SendError> {
        if !self.connection.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.write(node_id, envelope).await
    }

    async fn write(&self, node_id: &str, envelope: &MessageEnvelope) -> Result<(), SendError> {
        let frame = OutboundFrame {
            node_id: node_id.to_string(),
            topic: envelope.topic(),
            bytes: codec::encode(envelope)?,
        };

        match tokio::time::timeout(self.send_timeout, self.connection.link().send(frame)).await {
            Ok(Ok(())) => {
                debug!("[sender] {} -> {} on {}", envelope.tag(), node_id, envelope.topic());
                Ok(())
            }
            Ok(Err(e)) => Err(SendError::Link(e)),
            Err(_) => Err(SendError::DeliveryTimeout(self.send_timeout)),
        }
    }

    pub async fn send_heart_rate(&self, data: HeartRateData) -> Result<(), SendError> {
        self.send(Payload::HeartRate(data)).await
    }

    pub async fn send_audio(&self, data: AudioData) -> Result<(), SendError> {
        self.send(Payload::Audio(data)).await
    }

    pub async fn send_command(&self, command: AssignmentCommand) -> Result<(), SendError> {
        debug!("[sender] drone command '{}'", command.name());
        self.send(Payload::Command(command)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::models::{DroneCancelRequest, MatchStatus};
    use crate::store::ManualClock;
    use crate::topics::Topic;

    fn sender(link: &MemoryLink) -> (OutboundSender, Arc<ConnectionManager>) {
        let conn = Arc::new(ConnectionManager::new(Arc::new(link.clone()), Duration::from_secs(5)));
        let sender = OutboundSender::new(conn.clone(), Arc::new(ManualClock::new(1_000)), "backend", Duration::from_secs(5));
        (sender, conn)
    }

    fn heart_rate() -> HeartRateData {
        HeartRateData { bpm: 92.0, pulse_flag: false, timestamp: 1_000 }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_fails_fast_and_reconnects_once() {
        let link = MemoryLink::new();
        let (sender, conn) = sender(&link);

        assert!(matches!(sender.send_heart_rate(heart_rate()).await, Err(SendError::NotConnected)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(link.connect_attempts(), 1);
        assert!(conn.is_connected());
        // the payload is not retried after the reconnect
        assert!(link.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_connected_send_reaches_upstream_on_its_channel() {
        let link = MemoryLink::new();
        let (sender, conn) = sender(&link);
        conn.connect().await;

        sender.send_heart_rate(heart_rate()).await.unwrap();
        sender.send_command(AssignmentCommand::Cancel(DroneCancelRequest { drone_id: 3 })).await.unwrap();

        let sensor = link.envelopes_on(Topic::SensorData);
        assert_eq!(sensor.len(), 1);
        assert_eq!(sensor[0].timestamp(), 1_000);
        assert_eq!(link.frames_to("backend").len(), 2);
        assert_eq!(link.frames_on(Topic::Control).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_triggers_reconnect() {
        let link = MemoryLink::new();
        let (sender, conn) = sender(&link);
        conn.connect().await;
        link.hang_node("backend");

        let result = sender.send_audio(AudioData { average_db: 80.0, danger_flag: true, timestamp: 1 }).await;
        assert!(matches!(result, Err(SendError::DeliveryTimeout(d)) if d == Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.connect_attempts(), 2);
        assert_eq!(conn.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_does_not_reconnect() {
        let link = MemoryLink::new();
        let (sender, conn) = sender(&link);
        conn.connect().await;
        link.fail_node("watch-1");

        let envelope = sender.envelope(Payload::Assignment(crate::models::DroneAssignmentState::new(
            1,
            MatchStatus::Assigned,
        )));
        assert!(matches!(sender.deliver("watch-1", &envelope).await, Err(SendError::Link(_))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.connect_attempts(), 1);
        assert_eq!(link.disconnects(), 0);
    }
}
