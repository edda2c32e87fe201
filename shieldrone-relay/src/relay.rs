/*!
 * RELAY - Inbound router and user-facing operations
 *
 * ROLE :
 * Assembles connection, store, dispatcher and sender around one link, routes
 * every inbound frame to the right component and exposes the operations the
 * app screens call (drone route / cancel / match, alert acknowledgement,
 * sensor streaming).
 *
 * INBOUND ROUTING :
 * - sendWarning  -> AlertDispatcher
 * - safeConfirm  -> clears the local danger alert, forwarded upstream
 * - droneState   -> SessionStore (and replicated to paired nodes on a phone)
 * - heartRate / audio / droneCommand from a paired node -> forwarded upstream
 * - unknown tags, decode faults -> logged and skipped
 * - link drop    -> connection state machine
 */

use crate::codec::{self, DecodeFault, MessageEnvelope, Payload};
use crate::config::{NodeRole, RelayConfig};
use crate::connection::{ConnectionManager, ReconnectPolicy};
use crate::directory::NodeDirectory;
use crate::dispatcher::{AlertDispatcher, AlertSink, DispatchReport, FanOut};
use crate::health::HealthTracker;
use crate::link::{InboundFrame, LinkEvent, NodeSource, TransportLink};
use crate::models::{
    AssignmentCommand, AudioData, DroneAssignmentState, DroneCancelRequest, DroneMatchRequest, DroneRouteRequest,
    EndLocation, HeartRateData, SafetyConfirmation,
};
use crate::notice::spawn_connection_notices;
use crate::sender::{OutboundSender, SendError};
use crate::store::{Clock, KeyValueStore, SessionChange, SessionStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no drone assignment in progress")]
    NoAssignment,
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// What the router did with one inbound event.
#[derive(Debug)]
pub enum InboundOutcome {
    Alert(DispatchReport),
    SafetyConfirmed { cleared: bool, forwarded: bool },
    Session { change: SessionChange, replicated: FanOut },
    Forwarded { tag: String },
    Ignored { tag: String },
    Rejected(DecodeFault),
    LinkLost,
    /// Drop reported by a transport session that was already replaced.
    StaleDrop,
    Failed(String),
}

pub struct Relay {
    node_id: String,
    role: NodeRole,
    connection: Arc<ConnectionManager>,
    store: Arc<SessionStore>,
    dispatcher: Arc<AlertDispatcher>,
    sender: OutboundSender,
    health: HealthTracker,
    sink: Arc<dyn AlertSink>,
}

impl Relay {
    pub fn new(
        cfg: &RelayConfig,
        link: Arc<dyn TransportLink>,
        nodes: Arc<dyn NodeSource>,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(link, cfg.connect_timeout()));
        let store = Arc::new(SessionStore::new(kv, clock.clone(), cfg.assignment_ttl()));
        let sender = OutboundSender::new(connection.clone(), clock, cfg.upstream_node.clone(), cfg.send_timeout());
        let directory = NodeDirectory::new(nodes, cfg.directory_timeout());
        let health = HealthTracker::new(cfg.node_id.clone());
        let dispatcher = Arc::new(AlertDispatcher::new(
            sink.clone(),
            directory,
            sender.clone(),
            connection.clone(),
            health.clone(),
            cfg.dispatcher_settings(),
        ));

        info!("[relay] {} ready as {:?} (upstream: {})", cfg.node_id, cfg.role, cfg.upstream_node);
        Self {
            node_id: cfg.node_id.clone(),
            role: cfg.role,
            connection,
            store,
            dispatcher,
            sender,
            health,
            sink,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    pub fn sender(&self) -> &OutboundSender {
        &self.sender
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    fn is_upstream(&self, node_id: &str) -> bool {
        node_id == self.sender.upstream()
    }

    // ---- inbound ----

    /// Drains the link's event channel, one task per event.
    pub fn spawn_inbound_loop(self: &Arc<Self>, mut events: mpsc::Receiver<LinkEvent>) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay.handle_event(event).await;
                });
            }
            debug!("[relay] inbound channel closed");
        })
    }

    pub async fn handle_event(&self, event: LinkEvent) -> InboundOutcome {
        match event {
            LinkEvent::Message(frame) => self.handle_frame(frame).await,
            LinkEvent::Dropped { session, cause } => {
                if self.connection.report_link_lost(session, &cause).await {
                    InboundOutcome::LinkLost
                } else {
                    InboundOutcome::StaleDrop
                }
            }
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) -> InboundOutcome {
        let envelope = match codec::decode(&frame.bytes) {
            Ok(envelope) => envelope,
            Err(fault) => {
                warn!("[relay] skipping frame from {} on {}: {}", frame.node_id, frame.topic, fault);
                self.health.record_decode_fault();
                return InboundOutcome::Rejected(fault);
            }
        };

        if envelope.topic() != frame.topic {
            debug!("[relay] {} arrived on {} instead of {}", envelope.tag(), frame.topic, envelope.topic());
        }

        let origin = frame.node_id.as_str();
        match envelope.payload() {
            Payload::DangerAlert(alert) => {
                InboundOutcome::Alert(self.dispatcher.handle_alert(alert.clone(), Some(origin)).await)
            }
            Payload::Safety(confirmation) => self.on_safety(origin, confirmation, &envelope).await,
            Payload::Assignment(update) => self.on_assignment(origin, update, &envelope).await,
            Payload::HeartRate(_) | Payload::Audio(_) | Payload::Command(_) => {
                self.forward_upstream(origin, &envelope).await
            }
            Payload::Health(report) => {
                debug!("[relay] health from {}: {} ({}s)", report.node_id, report.connection, report.uptime_seconds);
                InboundOutcome::Ignored { tag: envelope.tag().to_string() }
            }
            Payload::Unknown { tag, .. } => {
                info!("[relay] unknown message '{}' from {}, skipped", tag, origin);
                InboundOutcome::Ignored { tag: tag.clone() }
            }
        }
    }

    async fn on_safety(
        &self,
        origin: &str,
        confirmation: &SafetyConfirmation,
        envelope: &MessageEnvelope,
    ) -> InboundOutcome {
        let cleared = self.dispatcher.acknowledge_remote(confirmation);
        if self.is_upstream(origin) {
            return InboundOutcome::SafetyConfirmed { cleared, forwarded: false };
        }

        let forwarded = match self.sender.send_to(self.sender.upstream(), envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[relay] safety confirmation from {} not forwarded: {}", origin, e);
                false
            }
        };
        InboundOutcome::SafetyConfirmed { cleared, forwarded }
    }

    async fn on_assignment(
        &self,
        origin: &str,
        update: &DroneAssignmentState,
        envelope: &MessageEnvelope,
    ) -> InboundOutcome {
        let change = match self.store.apply_update(update) {
            Ok(change) => change,
            Err(e) => {
                error!("[relay] cannot apply assignment update for drone {}: {}", update.drone_id, e);
                return InboundOutcome::Failed(e.to_string());
            }
        };

        let replicated = if self.role.forwards_alerts() {
            self.dispatcher.fan_out(envelope, Some(origin)).await
        } else {
            FanOut::NotForwarded
        };
        InboundOutcome::Session { change, replicated }
    }

    async fn forward_upstream(&self, origin: &str, envelope: &MessageEnvelope) -> InboundOutcome {
        let tag = envelope.tag().to_string();
        if self.role != NodeRole::Phone || self.is_upstream(origin) {
            debug!("[relay] {} from {} not forwarded", tag, origin);
            return InboundOutcome::Ignored { tag };
        }

        match self.sender.send_to(self.sender.upstream(), envelope).await {
            Ok(()) => InboundOutcome::Forwarded { tag },
            Err(e) => {
                warn!("[relay] {} from {} not forwarded: {}", tag, origin, e);
                InboundOutcome::Failed(e.to_string())
            }
        }
    }

    // ---- assignment commands ----

    pub async fn request_drone_route(&self, hive_id: i64, end_location: EndLocation) -> Result<(), RelayError> {
        info!("[relay] requesting drone from hive {}", hive_id);
        let command = AssignmentCommand::Route(DroneRouteRequest { hive_id, end_location });
        Ok(self.sender.send_command(command).await?)
    }

    /// Asks the backend to cancel the current assignment; local state is only
    /// cleared once the request went out.
    pub async fn cancel_assignment(&self) -> Result<DroneAssignmentState, RelayError> {
        let current = match self.store.get() {
            Ok(current) => current.ok_or(RelayError::NoAssignment)?,
            Err(e) => {
                // no drone id to cancel with, drop the unreadable session locally
                warn!("[relay] assignment unreadable, clearing it: {}", e);
                self.store.clear()?;
                return Err(e.into());
            }
        };
        let command = AssignmentCommand::Cancel(DroneCancelRequest { drone_id: current.drone_id });
        self.sender.send_command(command).await?;
        self.store.clear()?;
        info!("[relay] drone {} canceled", current.drone_id);
        Ok(current)
    }

    /// Sends the code the user read on the drone.
    pub async fn confirm_match(&self, drone_code: i32) -> Result<(), RelayError> {
        let current = self.store.get()?.ok_or(RelayError::NoAssignment)?;
        let command = AssignmentCommand::Match(DroneMatchRequest { drone_id: current.drone_id, drone_code });
        Ok(self.sender.send_command(command).await?)
    }

    /// Clears an assignment whose timer ran out and tells the backend, best effort.
    pub async fn expire_assignment_if_due(&self) -> Option<DroneAssignmentState> {
        let expired = match self.store.expire_if_due() {
            Ok(Some(expired)) => expired,
            Ok(None) => return None,
            Err(e) => {
                warn!("[relay] assignment expiry check failed: {}", e);
                return None;
            }
        };

        info!("[relay] drone {} not matched in time, canceling", expired.drone_id);
        let command = AssignmentCommand::Cancel(DroneCancelRequest { drone_id: expired.drone_id });
        if let Err(e) = self.sender.send_command(command).await {
            warn!("[relay] cancel for expired drone {} not sent: {}", expired.drone_id, e);
        }
        Some(expired)
    }

    pub fn spawn_assignment_watch(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                relay.expire_assignment_if_due().await;
            }
        })
    }

    // ---- alerts & sensors ----

    pub async fn acknowledge_alert(&self) -> Result<Option<SafetyConfirmation>, RelayError> {
        Ok(self.dispatcher.acknowledge().await?)
    }

    pub async fn send_heart_rate(&self, data: HeartRateData) -> Result<(), RelayError> {
        Ok(self.sender.send_heart_rate(data).await?)
    }

    pub async fn send_audio(&self, data: AudioData) -> Result<(), RelayError> {
        Ok(self.sender.send_audio(data).await?)
    }

    // ---- background tasks ----

    pub fn spawn_supervisor(&self, policy: ReconnectPolicy) -> JoinHandle<()> {
        self.connection.spawn_supervisor(policy)
    }

    pub fn spawn_connection_notices(&self, hide_after: Duration) -> JoinHandle<()> {
        spawn_connection_notices(&self.connection, self.sink.clone(), hide_after)
    }

    pub fn spawn_health_publisher(&self, every: Duration) -> JoinHandle<()> {
        self.health.spawn_health_publisher(self.connection.clone(), self.sender.clone(), every)
    }
}
