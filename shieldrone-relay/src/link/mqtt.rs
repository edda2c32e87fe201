/*!
 * MQTT LINK - Production transport over an MQTT broker
 *
 * TOPICS :
 * - `<prefix>/<recipient>/<channel>/<sender>` : addressed frames
 * - `<prefix>/presence/<node>`                : retained RemoteNode records
 *
 * Each node subscribes to its own inbox and to the presence records. On connect
 * it publishes itself as reachable; the broker's last will flips the record to
 * unreachable when the node vanishes without a clean disconnect.
 */

use super::{InboundFrame, LinkError, LinkEvent, LinkFuture, NodeSource, OutboundFrame, TransportLink};
use crate::config::RelayConfig;
use crate::models::RemoteNode;
use crate::state::{new_state, Shared};
use crate::topics::Topic;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MqttLinkSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub topic_prefix: String,
    pub node_id: String,
    pub display_name: String,
}

impl MqttLinkSettings {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            host: cfg.mqtt.host.clone(),
            port: cfg.mqtt.port,
            keep_alive: Duration::from_secs(cfg.mqtt.keep_alive_secs),
            topic_prefix: cfg.mqtt.topic_prefix.clone(),
            node_id: cfg.node_id.clone(),
            display_name: cfg.display_name.clone(),
        }
    }

    fn inbox_filter(&self) -> String {
        format!("{}/{}/+/+", self.topic_prefix, self.node_id)
    }

    fn presence_filter(&self) -> String {
        format!("{}/presence/+", self.topic_prefix)
    }

    fn presence_topic(&self) -> String {
        format!("{}/presence/{}", self.topic_prefix, self.node_id)
    }

    fn outbound_topic(&self, recipient: &str, topic: Topic) -> String {
        format!("{}/{}/{}/{}", self.topic_prefix, recipient, topic.channel(), self.node_id)
    }

    fn presence_payload(&self, reachable: bool) -> Result<Vec<u8>, LinkError> {
        let record = RemoteNode {
            node_id: self.node_id.clone(),
            display_name: self.display_name.clone(),
            reachable,
        };
        serde_json::to_vec(&record).map_err(|e| LinkError::Broker(e.to_string()))
    }
}

/// What an incoming publish is, given our prefix and identity.
#[derive(Debug, PartialEq)]
enum Routed {
    Frame { sender: String, topic: Topic },
    Presence { node_id: String },
    Ignored,
}

fn route_publish(settings: &MqttLinkSettings, topic: &str) -> Routed {
    let Some(rest) = topic.strip_prefix(&settings.topic_prefix).and_then(|r| r.strip_prefix('/')) else {
        return Routed::Ignored;
    };
    let levels: Vec<&str> = rest.split('/').collect();
    match levels.as_slice() {
        ["presence", node_id] => Routed::Presence { node_id: node_id.to_string() },
        [recipient, channel, sender] if *recipient == settings.node_id => {
            match Topic::from_path(channel) {
                Some(channel) => Routed::Frame { sender: sender.to_string(), topic: channel },
                None => Routed::Ignored,
            }
        }
        _ => Routed::Ignored,
    }
}

struct MqttSession {
    client: AsyncClient,
    poller: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

pub struct MqttLink {
    settings: MqttLinkSettings,
    events: mpsc::Sender<LinkEvent>,
    session: parking_lot::Mutex<Option<MqttSession>>,
    connected: Arc<AtomicBool>,
    sessions: AtomicU64,
    presence: Shared<HashMap<String, RemoteNode>>,
}

impl MqttLink {
    /// Builds the link and the receiver its inbound events are delivered on.
    pub fn new(settings: MqttLinkSettings, inbound_capacity: usize) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, receiver) = mpsc::channel(inbound_capacity.max(1));
        let link = Self {
            settings,
            events,
            session: parking_lot::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            sessions: AtomicU64::new(0),
            presence: new_state(HashMap::new()),
        };
        (link, receiver)
    }

    fn close_session(&self) -> Option<MqttSession> {
        self.connected.store(false, Ordering::SeqCst);
        let session = self.session.lock().take();
        if let Some(session) = &session {
            session.closing.store(true, Ordering::SeqCst);
        }
        session
    }
}

impl TransportLink for MqttLink {
    fn connect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            if let Some(stale) = self.close_session() {
                stale.poller.abort();
            }

            let client_id = format!("shieldrone-{}", self.settings.node_id);
            let mut opts = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
            opts.set_keep_alive(self.settings.keep_alive);
            opts.set_clean_session(true);
            opts.set_last_will(LastWill::new(
                self.settings.presence_topic(),
                self.settings.presence_payload(false)?,
                QoS::AtLeastOnce,
                true,
            ));

            let (client, eventloop) = AsyncClient::new(opts, 10);
            let (ready_tx, ready_rx) = oneshot::channel();
            let closing = Arc::new(AtomicBool::new(false));
            let session_id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            let poller = tokio::spawn(run_event_loop(
                eventloop,
                session_id,
                ready_tx,
                self.settings.clone(),
                self.events.clone(),
                self.presence.clone(),
                self.connected.clone(),
                closing.clone(),
            ));
            *self.session.lock() = Some(MqttSession { client: client.clone(), poller, closing });

            match ready_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if let Some(session) = self.close_session() {
                        session.poller.abort();
                    }
                    return Err(e);
                }
                Err(_) => return Err(LinkError::Closed),
            }

            let broker = |e: rumqttc::ClientError| LinkError::Broker(e.to_string());
            client.subscribe(self.settings.inbox_filter(), QoS::AtLeastOnce).await.map_err(broker)?;
            client.subscribe(self.settings.presence_filter(), QoS::AtLeastOnce).await.map_err(broker)?;
            client
                .publish(self.settings.presence_topic(), QoS::AtLeastOnce, true, self.settings.presence_payload(true)?)
                .await
                .map_err(broker)?;

            info!("[mqtt-link] connected to {}:{} as {}", self.settings.host, self.settings.port, self.settings.node_id);
            Ok(())
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut session) = self.close_session() else {
                return Ok(());
            };

            let offline = self.settings.presence_payload(false)?;
            let _ = session.client.publish(self.settings.presence_topic(), QoS::AtLeastOnce, true, offline).await;
            let result = session.client.disconnect().await.map_err(|e| LinkError::Broker(e.to_string()));

            // let the event loop flush the DISCONNECT before it is torn down
            if tokio::time::timeout(Duration::from_millis(500), &mut session.poller).await.is_err() {
                session.poller.abort();
            }
            info!("[mqtt-link] disconnected");
            result
        })
    }

    fn send(&self, frame: OutboundFrame) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            let client = self
                .session
                .lock()
                .as_ref()
                .map(|s| s.client.clone())
                .ok_or(LinkError::NotConnected)?;

            let topic = self.settings.outbound_topic(&frame.node_id, frame.topic);
            client
                .publish(topic, QoS::AtLeastOnce, false, frame.bytes)
                .await
                .map_err(|e| LinkError::Broker(e.to_string()))
        })
    }

    fn session(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl NodeSource for MqttLink {
    fn connected_nodes(&self) -> LinkFuture<'_, Vec<RemoteNode>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            let presence = self.presence.lock();
            Ok(presence.values().filter(|n| n.node_id != self.settings.node_id).cloned().collect())
        })
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    session: u64,
    ready: oneshot::Sender<Result<(), LinkError>>,
    settings: MqttLinkSettings,
    events: mpsc::Sender<LinkEvent>,
    presence: Shared<HashMap<String, RemoteNode>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => match route_publish(&settings, &p.topic) {
                Routed::Frame { sender, topic } => {
                    let frame = InboundFrame { node_id: sender, topic, bytes: p.payload.to_vec() };
                    if events.try_send(LinkEvent::Message(frame)).is_err() {
                        warn!("[mqtt-link] inbound queue full, dropping message on {}", p.topic);
                    }
                }
                Routed::Presence { node_id } => match serde_json::from_slice::<RemoteNode>(&p.payload) {
                    Ok(node) => {
                        debug!("[mqtt-link] presence {} reachable={}", node_id, node.reachable);
                        presence.lock().insert(node_id, node);
                    }
                    Err(e) => warn!("[mqtt-link] invalid presence record for {}: {}", node_id, e),
                },
                Routed::Ignored => debug!("[mqtt-link] ignoring publish on {}", p.topic),
            },
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(LinkError::Refused(e.to_string())));
                } else if !closing.load(Ordering::SeqCst) {
                    warn!("[mqtt-link] connection lost: {}", e);
                    let _ = events.try_send(LinkEvent::Dropped { session, cause: e.to_string() });
                }
                break;
            }
        }
    }
}
