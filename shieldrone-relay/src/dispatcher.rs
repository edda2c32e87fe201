/*!
 * ALERT DISPATCHER - Tiered local alerting + fan-out to paired nodes
 *
 * FLOW :
 * 1. record the alert on the board (one slot per tier)
 * 2. trigger the local alert through the `AlertSink`
 * 3. tier 1/2: schedule the auto-clear, tier 3: wait for acknowledgement
 * 4. fan out to every reachable paired node, each delivery on its own
 *
 * RULES :
 * - same timestamp + flag on a tier = duplicate, ignored
 * - a newer alert replaces the pending one and invalidates its auto-clear
 * - one failing node never blocks the others nor rolls back local state
 * - the sink is never called with the board locked
 */

use crate::codec::{MessageEnvelope, Payload};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::directory::{DirectoryError, NodeDirectory};
use crate::health::HealthTracker;
use crate::models::{AlertMessage, AlertTier, SafetyConfirmation};
use crate::sender::{OutboundSender, SendError};
use crate::state::{new_state, Shared};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_AUTO_DISMISS: Duration = Duration::from_secs(5);

/// UI / notification boundary.
pub trait AlertSink: Send + Sync {
    fn trigger(&self, tier: AlertTier, warning_flag: bool);

    fn dismiss(&self, tier: AlertTier);

    fn connection_notice(&self, _state: &ConnectionState) {}

    fn hide_connection_notice(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEffect {
    Triggered,
    /// Took over the slot of an older alert of the same tier.
    Replaced,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDelivery {
    pub node_id: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOut {
    Delivered(Vec<NodeDelivery>),
    NoReachableNodes,
    DirectoryTimedOut,
    DirectoryFailed(String),
    NotConnected,
    NotForwarded,
}

impl FanOut {
    pub fn deliveries(&self) -> &[NodeDelivery] {
        match self {
            FanOut::Delivered(deliveries) => deliveries,
            _ => &[],
        }
    }

    pub fn delivered_count(&self) -> usize {
        self.deliveries().iter().filter(|d| d.outcome == DeliveryOutcome::Delivered).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub tier: AlertTier,
    pub local: LocalEffect,
    pub fan_out: FanOut,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub auto_dismiss: Duration,
    /// Phones forward alerts to their watch; watches only display them.
    pub forward_alerts: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { auto_dismiss: DEFAULT_AUTO_DISMISS, forward_alerts: true }
    }
}

struct Slot {
    alert: AlertMessage,
    generation: u64,
}

#[derive(Default)]
struct AlertBoard {
    slots: HashMap<AlertTier, Slot>,
    next_generation: u64,
}

impl AlertBoard {
    fn record(&mut self, alert: &AlertMessage) -> (LocalEffect, u64) {
        if let Some(slot) = self.slots.get(&alert.level) {
            if slot.alert.same_alert(alert) {
                return (LocalEffect::Duplicate, slot.generation);
            }
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let previous = self.slots.insert(alert.level, Slot { alert: alert.clone(), generation });
        let effect = if previous.is_some() { LocalEffect::Replaced } else { LocalEffect::Triggered };
        (effect, generation)
    }

    /// Clears a slot only if it still holds the given generation.
    fn clear_if(&mut self, tier: AlertTier, generation: u64) -> bool {
        match self.slots.get(&tier) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(&tier);
                true
            }
            _ => false,
        }
    }
}

pub struct AlertDispatcher {
    board: Shared<AlertBoard>,
    sink: Arc<dyn AlertSink>,
    directory: NodeDirectory,
    sender: OutboundSender,
    connection: Arc<ConnectionManager>,
    health: HealthTracker,
    settings: DispatcherSettings,
}

impl AlertDispatcher {
    pub fn new(
        sink: Arc<dyn AlertSink>,
        directory: NodeDirectory,
        sender: OutboundSender,
        connection: Arc<ConnectionManager>,
        health: HealthTracker,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            board: new_state(AlertBoard::default()),
            sink,
            directory,
            sender,
            connection,
            health,
            settings,
        }
    }

    /// Alerts currently shown, lowest tier first.
    pub fn active_alerts(&self) -> Vec<AlertMessage> {
        let board = self.board.lock();
        let mut alerts: Vec<AlertMessage> = board.slots.values().map(|s| s.alert.clone()).collect();
        alerts.sort_by_key(|a| a.level);
        alerts
    }

    pub fn is_active(&self, tier: AlertTier) -> bool {
        self.board.lock().slots.contains_key(&tier)
    }

    /// Handles one inbound alert. `origin` is the node it came from, if any;
    /// it is never sent back there.
    pub async fn handle_alert(&self, alert: AlertMessage, origin: Option<&str>) -> DispatchReport {
        let tier = alert.level;
        let (local, generation) = self.board.lock().record(&alert);

        if local == LocalEffect::Duplicate {
            debug!("[dispatcher] duplicate {} alert ({}) ignored", tier, alert.timestamp);
            return DispatchReport { tier, local, fan_out: FanOut::NotForwarded };
        }

        info!("[dispatcher] {} alert (flag: {}, ts: {})", tier, alert.warning_flag, alert.timestamp);
        self.sink.trigger(tier, alert.warning_flag);
        self.health.record_alert();

        if tier.auto_dismisses() {
            self.schedule_auto_clear(tier, generation);
        }

        let fan_out = if self.settings.forward_alerts {
            let envelope = self.sender.envelope(Payload::DangerAlert(alert));
            self.fan_out(&envelope, origin).await
        } else {
            FanOut::NotForwarded
        };

        DispatchReport { tier, local, fan_out }
    }

    fn schedule_auto_clear(&self, tier: AlertTier, generation: u64) {
        let board = self.board.clone();
        let sink = self.sink.clone();
        let after = self.settings.auto_dismiss;

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let cleared = board.lock().clear_if(tier, generation);
            if cleared {
                debug!("[dispatcher] {} alert auto-cleared after {:?}", tier, after);
                sink.dismiss(tier);
            }
        });
    }

    /// Delivers to every reachable paired node except `origin` and upstream.
    pub async fn fan_out(&self, envelope: &MessageEnvelope, origin: Option<&str>) -> FanOut {
        if !self.connection.is_connected() {
            warn!("[dispatcher] {} not forwarded: link down", envelope.tag());
            self.connection.trigger_reconnect();
            return FanOut::NotConnected;
        }

        let nodes = match self.directory.reachable_nodes().await {
            Ok(nodes) => nodes,
            Err(DirectoryError::Timeout(_)) => return FanOut::DirectoryTimedOut,
            Err(DirectoryError::Fault(e)) => return FanOut::DirectoryFailed(e.to_string()),
        };

        let upstream = self.sender.upstream();
        let targets: Vec<String> = nodes
            .into_iter()
            .map(|n| n.node_id)
            .filter(|id| Some(id.as_str()) != origin && id != upstream)
            .collect();

        if targets.is_empty() {
            info!("[dispatcher] no paired node reachable, {} kept local", envelope.tag());
            return FanOut::NoReachableNodes;
        }

        let deliveries = targets.into_iter().map(|node_id| async move {
            let outcome = match self.sender.deliver(&node_id, envelope).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(SendError::DeliveryTimeout(_)) => DeliveryOutcome::TimedOut,
                Err(e) => DeliveryOutcome::Failed(e.to_string()),
            };
            if outcome != DeliveryOutcome::Delivered {
                warn!("[dispatcher] delivery of {} to {} failed: {:?}", envelope.tag(), node_id, outcome);
                self.health.record_failed_delivery();
            }
            NodeDelivery { node_id, outcome }
        });

        FanOut::Delivered(join_all(deliveries).await)
    }

    /// The user acknowledged the danger alert: clear it and answer "I am safe"
    /// upstream. Returns `Ok(None)` when no tier-3 alert was pending.
    pub async fn acknowledge(&self) -> Result<Option<SafetyConfirmation>, SendError> {
        let pending = self.board.lock().slots.remove(&AlertTier::Danger);
        let Some(slot) = pending else {
            debug!("[dispatcher] acknowledgement without pending danger alert");
            return Ok(None);
        };

        self.sink.dismiss(AlertTier::Danger);
        let confirmation = SafetyConfirmation {
            alert_timestamp: slot.alert.timestamp,
            confirmed_at: self.sender.now_millis(),
        };
        info!("[dispatcher] danger alert {} acknowledged", confirmation.alert_timestamp);

        let envelope = self.sender.envelope(Payload::Safety(confirmation.clone()));
        let upstream = self.sender.send_to(self.sender.upstream(), &envelope);
        if self.settings.forward_alerts {
            // paired watches clear their copy, without holding back the upstream answer
            let (sent, fan_out) = tokio::join!(upstream, self.fan_out(&envelope, None));
            debug!("[dispatcher] confirmation fan-out: {:?}", fan_out);
            sent?;
        } else {
            upstream.await?;
        }
        Ok(Some(confirmation))
    }

    /// A confirmation made on another device clears the local copy without
    /// producing a second confirmation.
    pub fn acknowledge_remote(&self, confirmation: &SafetyConfirmation) -> bool {
        let cleared = {
            let mut board = self.board.lock();
            match board.slots.get(&AlertTier::Danger) {
                Some(slot) if slot.alert.timestamp == confirmation.alert_timestamp => {
                    board.slots.remove(&AlertTier::Danger);
                    true
                }
                _ => false,
            }
        };

        if cleared {
            info!("[dispatcher] danger alert {} confirmed remotely", confirmation.alert_timestamp);
            self.sink.dismiss(AlertTier::Danger);
        } else {
            debug!("[dispatcher] confirmation for {} matches no pending alert", confirmation.alert_timestamp);
        }
        cleared
    }
}
