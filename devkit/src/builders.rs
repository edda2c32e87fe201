/*!
Message builders

Typed envelopes for the harness and raw wire JSON for tests that need to feed
the codec something it did not produce itself (older peers, corrupted input).
*/

use serde_json::Value;
use shieldrone_relay::models::{
    AlertMessage, AlertTier, AudioData, DroneAssignmentState, HeartRateData, MatchStatus, SafetyConfirmation,
};
use shieldrone_relay::{MessageEnvelope, Payload};

/// Current wall time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MessageBuilder;

impl MessageBuilder {
    pub fn alert(tier: AlertTier, timestamp: i64) -> AlertMessage {
        AlertMessage { level: tier, warning_flag: true, timestamp }
    }

    pub fn alert_envelope(tier: AlertTier, timestamp: i64) -> MessageEnvelope {
        MessageEnvelope::new(Payload::DangerAlert(Self::alert(tier, timestamp)), timestamp)
    }

    pub fn safe_confirm(alert_timestamp: i64) -> MessageEnvelope {
        let confirmed_at = now_millis();
        MessageEnvelope::new(Payload::Safety(SafetyConfirmation { alert_timestamp, confirmed_at }), confirmed_at)
    }

    pub fn heart_rate(bpm: f64, pulse_flag: bool) -> MessageEnvelope {
        let timestamp = now_millis();
        MessageEnvelope::new(Payload::HeartRate(HeartRateData { bpm, pulse_flag, timestamp }), timestamp)
    }

    pub fn audio(average_db: f64, danger_flag: bool) -> MessageEnvelope {
        let timestamp = now_millis();
        MessageEnvelope::new(Payload::Audio(AudioData { average_db, danger_flag, timestamp }), timestamp)
    }

    pub fn assignment(state: DroneAssignmentState) -> MessageEnvelope {
        MessageEnvelope::new(Payload::Assignment(state), now_millis())
    }

    /// Wire JSON for any tag, known or not.
    pub fn raw(tag: &str, payload: Value) -> Value {
        serde_json::json!({
            "type": tag,
            "timestamp": now_millis(),
            "payload": payload
        })
    }

    /// `sendWarning` as the backend pushes it.
    pub fn raw_warning(level: u8, warning_flag: bool, timestamp: i64) -> Value {
        Self::raw(
            "sendWarning",
            serde_json::json!({
                "level": level,
                "warningFlag": warning_flag,
                "timestamp": timestamp
            }),
        )
    }
}

/// Fluent builder for assignment updates; unset fields stay absent on the wire.
#[derive(Debug, Clone)]
pub struct AssignmentBuilder {
    state: DroneAssignmentState,
}

impl AssignmentBuilder {
    pub fn new(drone_id: i64, status: MatchStatus) -> Self {
        Self { state: DroneAssignmentState::new(drone_id, status) }
    }

    pub fn station_ip(mut self, ip: &str) -> Self {
        self.state.station_ip = Some(ip.to_string());
        self
    }

    pub fn battery(mut self, battery: i32) -> Self {
        self.state.battery = Some(battery);
        self
    }

    pub fn estimated_time(mut self, seconds: i32) -> Self {
        self.state.estimated_time = Some(seconds);
        self
    }

    pub fn distance(mut self, km: f64) -> Self {
        self.state.distance = Some(km);
        self
    }

    pub fn assigned_now(mut self) -> Self {
        self.state.assigned_time = Some(now_millis());
        self
    }

    pub fn build(self) -> DroneAssignmentState {
        self.state
    }

    pub fn envelope(self) -> MessageEnvelope {
        MessageBuilder::assignment(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shieldrone_relay::codec;

    #[test]
    fn test_raw_warning_decodes() {
        let raw = MessageBuilder::raw_warning(2, true, 1234);
        let envelope = codec::decode(&serde_json::to_vec(&raw).unwrap()).unwrap();
        match envelope.payload() {
            Payload::DangerAlert(alert) => {
                assert_eq!(alert.level, AlertTier::Warning);
                assert_eq!(alert.timestamp, 1234);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_assignment_builder_leaves_unset_fields_off_the_wire() {
        let envelope = AssignmentBuilder::new(3, MatchStatus::Assigned).battery(77).envelope();
        let json: Value = serde_json::from_slice(&codec::encode(&envelope).unwrap()).unwrap();

        assert_eq!(json["type"], "droneState");
        assert_eq!(json["payload"]["battery"], 77);
        assert_eq!(json["payload"]["matchStatus"], "ASSIGNED");
        assert!(json["payload"].get("stationIP").is_none());
    }
}
