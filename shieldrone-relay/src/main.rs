/**
 * SHIELDRONE RELAY - Daemon entry point
 *
 * ROLE : wires the relay core to an MQTT broker: config, file store, link,
 * inbound loop, reconnect supervisor, assignment expiry watch, connection
 * notices and health publisher. Runs until Ctrl-C, then leaves cleanly so the
 * presence record flips to unreachable.
 */

use anyhow::{Context, Result};
use shieldrone_relay::config::load_config;
use shieldrone_relay::link::mqtt::MqttLinkSettings;
use shieldrone_relay::models::AlertTier;
use shieldrone_relay::{AlertSink, ConnectionState, FileStore, MqttLink, Relay, SystemClock};
use std::sync::Arc;
use tracing::{info, warn};

/// No screen here: alerts and notices go to the log.
struct LogSink;

impl AlertSink for LogSink {
    fn trigger(&self, tier: AlertTier, warning_flag: bool) {
        warn!("[ui] ALERT {} (warning: {})", tier, warning_flag);
    }

    fn dismiss(&self, tier: AlertTier) {
        info!("[ui] alert {} dismissed", tier);
    }

    fn connection_notice(&self, state: &ConnectionState) {
        info!("[ui] connection: {}", state);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = load_config().await;
    info!("[relay] starting {} ({:?})", cfg.node_id, cfg.role);

    let kv = FileStore::open(&cfg.store_path)
        .with_context(|| format!("failed to open store at {}", cfg.store_path))?;

    let (link, inbound) = MqttLink::new(MqttLinkSettings::from_config(&cfg), cfg.mqtt.inbound_capacity);
    let link = Arc::new(link);

    let relay = Arc::new(Relay::new(
        &cfg,
        link.clone(),
        link,
        Arc::new(kv),
        Arc::new(SystemClock),
        Arc::new(LogSink),
    ));

    let tasks = vec![
        relay.spawn_inbound_loop(inbound),
        relay.spawn_supervisor(cfg.reconnect_policy()),
        relay.spawn_assignment_watch(cfg.assignment_check_interval()),
        relay.spawn_connection_notices(cfg.notice_duration()),
        relay.spawn_health_publisher(cfg.health_interval()),
    ];

    // a failed first connect is picked up by the supervisor
    let state = relay.connection().connect().await;
    info!("[relay] initial connection: {}", state);

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("[relay] shutting down");

    for task in &tasks {
        task.abort();
    }
    relay.connection().disconnect().await;
    Ok(())
}
