/*!
 * SHIELDRONE RELAY - Cross-device alert and session-state relay
 *
 * ROLE :
 * Message-passing core shared by the phone and the watch: one link, a
 * connection state machine, typed envelopes on three channels (danger alerts,
 * sensor data, control), tiered alert dispatch and the persisted drone
 * assignment.
 *
 * LAYERS (leaves first) :
 * link -> codec -> connection -> store / directory -> sender -> dispatcher -> relay
 */

pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod health;
pub mod link;
pub mod models;
pub mod notice;
pub mod relay;
pub mod sender;
pub mod state;
pub mod store;
pub mod topics;

pub use codec::{decode, encode, DecodeFault, MessageEnvelope, Payload};
pub use config::{load_config, NodeRole, RelayConfig};
pub use connection::{ConnectionFault, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use dispatcher::{AlertDispatcher, AlertSink, DeliveryOutcome, DispatchReport, FanOut, LocalEffect};
pub use link::{LinkError, LinkEvent, MemoryLink, MqttLink, NodeSource, TransportLink};
pub use relay::{InboundOutcome, Relay, RelayError};
pub use sender::{OutboundSender, SendError};
pub use store::{Clock, FileStore, KeyValueStore, ManualClock, MemoryStore, SessionStore, SystemClock};
pub use topics::Topic;
