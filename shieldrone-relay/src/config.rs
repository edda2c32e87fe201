use crate::connection::ReconnectPolicy;
use crate::dispatcher::DispatcherSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Talks to the backend and forwards alerts to its watch.
    Phone,
    /// Displays alerts and streams sensors to its phone.
    Watch,
}

impl NodeRole {
    pub fn forwards_alerts(self) -> bool {
        matches!(self, NodeRole::Phone)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub node_id: String,
    pub display_name: String,
    pub role: NodeRole,
    /// Node the relay reports to: the backend for a phone, the phone for a watch.
    pub upstream_node: String,
    pub mqtt: MqttConf,
    pub store_path: String,
    pub timeouts: TimeoutConf,
    pub alerts: AlertConf,
    pub assignment: AssignmentConf,
    pub reconnect: ReconnectConf,
    pub health: HealthConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
    pub inbound_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConf {
    pub connect_ms: u64,
    pub send_ms: u64,
    pub directory_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConf {
    pub auto_dismiss_ms: u64,
    pub status_notice_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AssignmentConf {
    pub ttl_secs: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConf {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConf {
    pub publish_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_id: format!("phone-{}", uuid::Uuid::new_v4()),
            display_name: "ShieldDrone phone".into(),
            role: NodeRole::Phone,
            upstream_node: "backend".into(),
            mqtt: MqttConf::default(),
            store_path: "./data/relay-store.json".into(),
            timeouts: TimeoutConf::default(),
            alerts: AlertConf::default(),
            assignment: AssignmentConf::default(),
            reconnect: ReconnectConf::default(),
            health: HealthConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 15,
            topic_prefix: "shieldrone".into(),
            inbound_capacity: 64,
        }
    }
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self { connect_ms: 5_000, send_ms: 5_000, directory_ms: 5_000 }
    }
}

impl Default for AlertConf {
    fn default() -> Self {
        Self { auto_dismiss_ms: 5_000, status_notice_ms: 3_000 }
    }
}

impl Default for AssignmentConf {
    fn default() -> Self {
        Self { ttl_secs: 600, check_interval_secs: 15 }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { initial_delay_ms: 2_000, max_delay_ms: 60_000, multiplier: 2 }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { publish_interval_secs: 30 }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.send_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.directory_ms)
    }

    pub fn notice_duration(&self) -> Duration {
        Duration::from_millis(self.alerts.status_notice_ms)
    }

    pub fn assignment_ttl(&self) -> Duration {
        Duration::from_secs(self.assignment.ttl_secs)
    }

    pub fn assignment_check_interval(&self) -> Duration {
        Duration::from_secs(self.assignment.check_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.publish_interval_secs.max(1))
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            auto_dismiss: Duration::from_millis(self.alerts.auto_dismiss_ms),
            forward_alerts: self.role.forwards_alerts(),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial_delay_ms = self.reconnect.initial_delay_ms.max(1);
        ReconnectPolicy {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms.max(initial_delay_ms)),
            multiplier: self.reconnect.multiplier,
        }
    }
}

pub fn parse_config(txt: &str) -> Result<RelayConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(RelayConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Reads `$SHIELDRONE_RELAY_CONFIG` (default `relay.yaml`). Missing or invalid
/// files fall back to the defaults.
pub async fn load_config() -> RelayConfig {
    let path = std::env::var("SHIELDRONE_RELAY_CONFIG").unwrap_or_else(|_| "relay.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> RelayConfig {
    if !Path::new(path).exists() {
        warn!("[relay] no {}, using default config", path);
        return RelayConfig::default();
    }

    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!("[relay] cannot read {}: {}", path, e);
            return RelayConfig::default();
        }
    };

    parse_config(&txt).unwrap_or_else(|e| {
        warn!("[relay] invalid config {}: {}", path, e);
        RelayConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            r#"
node_id: watch-7
role: watch
upstream_node: phone-7
mqtt:
  host: broker.local
alerts:
  auto_dismiss_ms: 2500
"#,
        )
        .unwrap();

        assert_eq!(cfg.node_id, "watch-7");
        assert_eq!(cfg.role, NodeRole::Watch);
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.assignment_ttl(), Duration::from_secs(600));

        let settings = cfg.dispatcher_settings();
        assert_eq!(settings.auto_dismiss, Duration::from_millis(2500));
        assert!(!settings.forward_alerts);
    }

    #[test]
    fn test_zero_reconnect_delay_is_clamped() {
        let cfg = parse_config("reconnect:\n  initial_delay_ms: 0\n  max_delay_ms: 0\n").unwrap();
        let policy = cfg.reconnect_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1));
    }

    #[test]
    fn test_default_node_ids_are_unique() {
        let a = RelayConfig::default();
        let b = RelayConfig::default();
        assert!(a.node_id.starts_with("phone-"));
        assert_ne!(a.node_id, b.node_id);
        assert!(a.role.forwards_alerts());
    }

    #[tokio::test]
    async fn test_invalid_or_missing_file_falls_back() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let cfg = load_config_from(missing.to_str().unwrap()).await;
        assert_eq!(cfg.upstream_node, "backend");

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "role: [not, a, role]").unwrap();
        let cfg = load_config_from(broken.to_str().unwrap()).await;
        assert_eq!(cfg.role, NodeRole::Phone);

        let good = dir.path().join("relay.yaml");
        std::fs::write(&good, "store_path: /tmp/x.json\nreconnect:\n  multiplier: 3\n").unwrap();
        let cfg = load_config_from(good.to_str().unwrap()).await;
        assert_eq!(cfg.store_path, "/tmp/x.json");
        assert_eq!(cfg.reconnect_policy().multiplier, 3);
    }
}
