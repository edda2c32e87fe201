//! Envelope codec.
//!
//! Wire format: `{"type": <tag>, "timestamp": <epoch ms>, "payload": {...}}` as UTF-8 JSON.
//! Tags this build does not know decode to [`Payload::Unknown`] so a newer peer
//! never breaks the receive loop.

use crate::models::{
    AlertMessage, AssignmentCommand, AudioData, DroneAssignmentState, HealthReport, HeartRateData,
    SafetyConfirmation,
};
use crate::topics::Topic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TAG_DANGER_ALERT: &str = "sendWarning";
pub const TAG_SAFETY: &str = "safeConfirm";
pub const TAG_HEART_RATE: &str = "heartRate";
pub const TAG_AUDIO: &str = "audio";
pub const TAG_ASSIGNMENT: &str = "droneState";
pub const TAG_COMMAND: &str = "droneCommand";
pub const TAG_HEALTH: &str = "relayHealth";

const KNOWN_TAGS: [&str; 7] = [
    TAG_DANGER_ALERT,
    TAG_SAFETY,
    TAG_HEART_RATE,
    TAG_AUDIO,
    TAG_ASSIGNMENT,
    TAG_COMMAND,
    TAG_HEALTH,
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeFault {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid '{tag}' payload: {reason}")]
    InvalidPayload { tag: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("untyped payload cannot use the reserved tag '{0}'")]
    ReservedTag(String),
    #[error("'{tag}' field {field} is not a finite number")]
    NonFinite { tag: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    DangerAlert(AlertMessage),
    Safety(SafetyConfirmation),
    HeartRate(HeartRateData),
    Audio(AudioData),
    Assignment(DroneAssignmentState),
    Command(AssignmentCommand),
    Health(HealthReport),
    Unknown { tag: String, body: Value },
}

impl Payload {
    pub fn tag(&self) -> &str {
        match self {
            Payload::DangerAlert(_) => TAG_DANGER_ALERT,
            Payload::Safety(_) => TAG_SAFETY,
            Payload::HeartRate(_) => TAG_HEART_RATE,
            Payload::Audio(_) => TAG_AUDIO,
            Payload::Assignment(_) => TAG_ASSIGNMENT,
            Payload::Command(_) => TAG_COMMAND,
            Payload::Health(_) => TAG_HEALTH,
            Payload::Unknown { tag, .. } => tag,
        }
    }

    /// Channel a payload of this kind travels on.
    pub fn topic(&self) -> Topic {
        match self {
            Payload::DangerAlert(_) | Payload::Safety(_) => Topic::DangerAlert,
            Payload::HeartRate(_) | Payload::Audio(_) => Topic::SensorData,
            Payload::Assignment(_) | Payload::Command(_) | Payload::Health(_) | Payload::Unknown { .. } => {
                Topic::Control
            }
        }
    }

    /// Rejects payloads that would encode to something `decode` refuses:
    /// JSON has no NaN or infinity, and known tags must carry their typed body.
    fn check_encodable(&self) -> Result<(), EncodeError> {
        let finite = |field: &'static str, value: f64| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(EncodeError::NonFinite { tag: self.tag().to_string(), field })
            }
        };

        match self {
            Payload::HeartRate(data) => finite("bpm", data.bpm),
            Payload::Audio(data) => finite("averageDb", data.average_db),
            Payload::Assignment(state) => state.distance.map_or(Ok(()), |d| finite("distance", d)),
            Payload::Command(AssignmentCommand::Route(route)) => {
                finite("endLocation.lat", route.end_location.lat)?;
                finite("endLocation.lng", route.end_location.lng)
            }
            Payload::Unknown { tag, .. } if KNOWN_TAGS.contains(&tag.as_str()) => {
                Err(EncodeError::ReservedTag(tag.clone()))
            }
            _ => Ok(()),
        }
    }

    fn body(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::DangerAlert(alert) => serde_json::to_value(alert),
            Payload::Safety(confirmation) => serde_json::to_value(confirmation),
            Payload::HeartRate(data) => serde_json::to_value(data),
            Payload::Audio(data) => serde_json::to_value(data),
            Payload::Assignment(state) => serde_json::to_value(state),
            Payload::Command(command) => serde_json::to_value(command),
            Payload::Health(report) => serde_json::to_value(report),
            Payload::Unknown { body, .. } => Ok(body.clone()),
        }
    }

    fn from_wire(tag: String, body: Value) -> Result<Payload, DecodeFault> {
        let payload = match tag.as_str() {
            TAG_DANGER_ALERT => Payload::DangerAlert(typed(&tag, body)?),
            TAG_SAFETY => Payload::Safety(typed(&tag, body)?),
            TAG_HEART_RATE => Payload::HeartRate(typed(&tag, body)?),
            TAG_AUDIO => Payload::Audio(typed(&tag, body)?),
            TAG_ASSIGNMENT => Payload::Assignment(typed(&tag, body)?),
            TAG_COMMAND => Payload::Command(typed(&tag, body)?),
            TAG_HEALTH => Payload::Health(typed(&tag, body)?),
            _ => Payload::Unknown { tag, body },
        };
        Ok(payload)
    }
}

fn typed<T: DeserializeOwned>(tag: &str, body: Value) -> Result<T, DecodeFault> {
    serde_json::from_value(body).map_err(|e| DecodeFault::InvalidPayload {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// A message as produced by a sender. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    payload: Payload,
    timestamp: i64,
}

impl MessageEnvelope {
    pub fn new(payload: Payload, timestamp: i64) -> Self {
        Self { payload, timestamp }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn tag(&self) -> &str {
        self.payload.tag()
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    tag: String,
    timestamp: i64,
    #[serde(default)]
    payload: Value,
}

pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>, EncodeError> {
    envelope.payload.check_encodable()?;
    let wire = WireEnvelope {
        tag: envelope.tag().to_string(),
        timestamp: envelope.timestamp,
        payload: envelope.payload.body()?,
    };
    Ok(serde_json::to_vec(&wire)?)
}

pub fn decode(bytes: &[u8]) -> Result<MessageEnvelope, DecodeFault> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeFault::Malformed(e.to_string()))?;
    let payload = Payload::from_wire(wire.tag, wire.payload)?;
    Ok(MessageEnvelope::new(payload, wire.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use serde_json::json;

    fn samples() -> Vec<Payload> {
        let mut full = DroneAssignmentState::new(12, MatchStatus::Assigned);
        full.station_ip = Some("192.168.0.40".into());
        full.battery = Some(87);
        full.estimated_time = Some(240);
        full.distance = Some(1.25);
        full.assigned_time = Some(1_700_000_000_000);

        vec![
            Payload::DangerAlert(AlertMessage { level: AlertTier::Danger, warning_flag: true, timestamp: 42 }),
            Payload::DangerAlert(AlertMessage { level: AlertTier::Advisory, warning_flag: false, timestamp: 43 }),
            Payload::Safety(SafetyConfirmation { alert_timestamp: 42, confirmed_at: 50 }),
            Payload::HeartRate(HeartRateData { bpm: 128.5, pulse_flag: true, timestamp: 7 }),
            Payload::Audio(AudioData { average_db: 71.3, danger_flag: false, timestamp: 8 }),
            Payload::Assignment(full),
            Payload::Assignment(DroneAssignmentState::new(3, MatchStatus::Canceled)),
            Payload::Command(AssignmentCommand::Route(DroneRouteRequest {
                hive_id: 5,
                end_location: EndLocation { lat: 37.5012, lng: 127.0396 },
            })),
            Payload::Command(AssignmentCommand::Cancel(DroneCancelRequest { drone_id: 12 })),
            Payload::Command(AssignmentCommand::Match(DroneMatchRequest { drone_id: 12, drone_code: 4821 })),
            Payload::Health(HealthReport {
                node_id: "phone-1".into(),
                uptime_seconds: 300,
                connection: "connected".into(),
                reconnects: 2,
                alerts_dispatched: 4,
                deliveries_failed: 1,
                decode_faults: 0,
            }),
            Payload::Unknown { tag: "droneTelemetry".into(), body: json!({"altitude": 31.5, "legs": [1, 2]}) },
        ]
    }

    #[test]
    fn test_round_trip_every_kind() {
        for (i, payload) in samples().into_iter().enumerate() {
            let envelope = MessageEnvelope::new(payload, 1_000 + i as i64);
            let bytes = encode(&envelope).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, envelope, "kind {}", envelope.tag());
        }

        // an untyped body under a typed tag would not come back as it went out
        let shadowing = MessageEnvelope::new(
            Payload::Unknown { tag: TAG_DANGER_ALERT.into(), body: json!({"x": 1}) },
            1,
        );
        assert!(matches!(encode(&shadowing), Err(EncodeError::ReservedTag(tag)) if tag == TAG_DANGER_ALERT));
    }

    #[test]
    fn test_non_finite_numbers_are_refused() {
        let hr = MessageEnvelope::new(
            Payload::HeartRate(HeartRateData { bpm: f64::NAN, pulse_flag: true, timestamp: 1 }),
            1,
        );
        assert!(matches!(encode(&hr), Err(EncodeError::NonFinite { field: "bpm", .. })));

        let audio = MessageEnvelope::new(
            Payload::Audio(AudioData { average_db: f64::INFINITY, danger_flag: false, timestamp: 1 }),
            1,
        );
        assert!(matches!(encode(&audio), Err(EncodeError::NonFinite { field: "averageDb", .. })));

        let mut state = DroneAssignmentState::new(2, MatchStatus::Matched);
        state.distance = Some(f64::NEG_INFINITY);
        assert!(encode(&MessageEnvelope::new(Payload::Assignment(state), 1)).is_err());
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let bytes = br#"{"type":"newFeature","timestamp":5,"payload":{"x":1}}"#;
        let envelope = decode(bytes).unwrap();
        assert_eq!(envelope.tag(), "newFeature");
        assert_eq!(envelope.topic(), Topic::Control);
        assert!(matches!(envelope.payload(), Payload::Unknown { body, .. } if body["x"] == 1));
    }

    #[test]
    fn test_truncated_and_corrupted_bytes() {
        let envelope = MessageEnvelope::new(
            Payload::DangerAlert(AlertMessage { level: AlertTier::Warning, warning_flag: true, timestamp: 9 }),
            9,
        );
        let bytes = encode(&envelope).unwrap();

        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(decode(&bytes[..cut]), Err(DecodeFault::Malformed(_))), "cut at {cut}");
        }
        assert!(matches!(decode(&[0xff, 0xfe, 0x00]), Err(DecodeFault::Malformed(_))));
    }

    #[test]
    fn test_known_tag_with_bad_payload() {
        let bytes = br#"{"type":"sendWarning","timestamp":5,"payload":{"level":9,"warningFlag":true,"timestamp":5}}"#;
        match decode(bytes) {
            Err(DecodeFault::InvalidPayload { tag, .. }) => assert_eq!(tag, TAG_DANGER_ALERT),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_topic_per_kind() {
        let alert = Payload::DangerAlert(AlertMessage { level: AlertTier::Danger, warning_flag: true, timestamp: 1 });
        assert_eq!(alert.topic(), Topic::DangerAlert);
        let hr = Payload::HeartRate(HeartRateData { bpm: 80.0, pulse_flag: false, timestamp: 1 });
        assert_eq!(hr.topic(), Topic::SensorData);
    }
}
