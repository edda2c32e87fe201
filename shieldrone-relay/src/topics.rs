use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical channels multiplexed over one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    DangerAlert,
    SensorData,
    Control,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::DangerAlert, Topic::SensorData, Topic::Control];

    /// Message path as used by the wearable message client.
    pub fn path(self) -> &'static str {
        match self {
            Topic::DangerAlert => "/danger_alert",
            Topic::SensorData => "/sensor_data",
            Topic::Control => "/control",
        }
    }

    /// Single MQTT topic level for this channel.
    pub fn channel(self) -> &'static str {
        // the path without its leading slash
        &self.path()[1..]
    }

    pub fn from_path(path: &str) -> Option<Topic> {
        let name = extract_channel_name(path);
        Topic::ALL.into_iter().find(|t| t.channel() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Extracts the channel name from a path or a full topic
/// Ex: "shieldrone/watch-1/danger_alert/phone-1" -> "danger_alert" (third level)
pub fn extract_channel_name(topic: &str) -> &str {
    let trimmed = topic.trim_start_matches('/');
    let levels: Vec<&str> = trimmed.split('/').collect();
    match levels.len() {
        0 | 1 => trimmed,
        // <prefix>/<recipient>/<channel>/<sender>
        4 => levels[2],
        _ => levels.last().copied().unwrap_or(trimmed),
    }
}
