/*!
 * MODELS - Payload types exchanged between phone, watch and backend
 *
 * Field names follow the camelCase JSON the mobile apps and the backend already
 * speak. Every struct here is a plain value: no behaviour beyond conversions.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity. Tier 1 is the lowest, tier 3 requires acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AlertTier {
    Advisory = 1,
    Warning = 2,
    Danger = 3,
}

impl AlertTier {
    pub const ALL: [AlertTier; 3] = [AlertTier::Advisory, AlertTier::Warning, AlertTier::Danger];

    /// Tier 1/2 alerts clear themselves; tier 3 waits for the user.
    pub fn auto_dismisses(self) -> bool {
        !matches!(self, AlertTier::Danger)
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AlertTier {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(AlertTier::Advisory),
            2 => Ok(AlertTier::Warning),
            3 => Ok(AlertTier::Danger),
            other => Err(format!("unknown alert tier {other}")),
        }
    }
}

impl From<AlertTier> for u8 {
    fn from(tier: AlertTier) -> u8 {
        tier.level()
    }
}

impl fmt::Display for AlertTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", self.level())
    }
}

/// Danger alert pushed by the backend (`sendWarning`) and forwarded to the watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub level: AlertTier,
    pub warning_flag: bool,
    pub timestamp: i64,
}

impl AlertMessage {
    /// Two deliveries of the same alert carry the same timestamp and flag.
    pub fn same_alert(&self, other: &AlertMessage) -> bool {
        self.timestamp == other.timestamp && self.warning_flag == other.warning_flag
    }
}

/// "I am safe" answer produced when the user acknowledges a tier-3 alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfirmation {
    pub alert_timestamp: i64,
    pub confirmed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateData {
    pub bpm: f64,
    pub pulse_flag: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioData {
    pub average_db: f64,
    pub danger_flag: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// Drone allocated, waiting for the user to enter the drone code.
    Assigned,
    /// Code entered, escort in progress.
    Matched,
    Completed,
    Canceled,
}

impl MatchStatus {
    /// Statuses that end the assignment cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Canceled)
    }
}

/// Drone assignment aggregate. Also used as the partial update shape:
/// absent optional fields keep the stored value, `match_status` is mandatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneAssignmentState {
    pub drone_id: i64,
    #[serde(default, rename = "stationIP", skip_serializing_if = "Option::is_none")]
    pub station_ip: Option<String>,
    pub match_status: MatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_time: Option<i64>,
}

impl DroneAssignmentState {
    pub fn new(drone_id: i64, match_status: MatchStatus) -> Self {
        Self {
            drone_id,
            station_ip: None,
            match_status,
            battery: None,
            estimated_time: None,
            distance: None,
            assigned_time: None,
        }
    }

    /// Field-level merge: present fields of `update` win, absent ones keep `self`.
    /// Identity and status always come from `update`.
    pub fn merged_with(&self, update: &DroneAssignmentState) -> DroneAssignmentState {
        DroneAssignmentState {
            drone_id: update.drone_id,
            station_ip: update.station_ip.clone().or_else(|| self.station_ip.clone()),
            match_status: update.match_status,
            battery: update.battery.or(self.battery),
            estimated_time: update.estimated_time.or(self.estimated_time),
            distance: update.distance.or(self.distance),
            assigned_time: update.assigned_time.or(self.assigned_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndLocation {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneRouteRequest {
    pub hive_id: i64,
    pub end_location: EndLocation,
}

/// Sent when the code was not entered in time or the user gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneCancelRequest {
    pub drone_id: i64,
}

/// Sent when the user types the code shown on the drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneMatchRequest {
    pub drone_id: i64,
    pub drone_code: i32,
}

/// Assignment commands travelling upstream on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AssignmentCommand {
    Route(DroneRouteRequest),
    Cancel(DroneCancelRequest),
    Match(DroneMatchRequest),
}

impl AssignmentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AssignmentCommand::Route(_) => "route",
            AssignmentCommand::Cancel(_) => "cancel",
            AssignmentCommand::Match(_) => "match",
        }
    }
}

/// Relay health snapshot published upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub node_id: String,
    pub uptime_seconds: u64,
    pub connection: String,
    pub reconnects: u64,
    pub alerts_dispatched: u64,
    pub deliveries_failed: u64,
    pub decode_faults: u64,
}

/// A device reachable (or not) over the cross-device link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNode {
    pub node_id: String,
    pub display_name: String,
    pub reachable: bool,
}

impl RemoteNode {
    pub fn new(node_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: display_name.into(),
            reachable: true,
        }
    }
}
