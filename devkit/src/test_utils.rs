/*!
Test Harness for the relay

Assembles a complete relay over the in-memory link, store and clock:
- automatic setup of the fakes and of the background tasks
- helpers to inject frames as the backend or a paired watch would
- assertions on what went out and on what the user saw
*/

use crate::recording_sink::RecordingSink;
use anyhow::Result;
use serde_json::Value;
use shieldrone_relay::link::LinkEvent;
use shieldrone_relay::{
    ManualClock, MemoryLink, MemoryStore, MessageEnvelope, NodeRole, Relay, RelayConfig, Topic,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const PHONE_ID: &str = "phone-1";
pub const WATCH_ID: &str = "watch-1";
pub const BACKEND_ID: &str = "backend";

/// Full relay test harness
pub struct TestHarness {
    pub link: MemoryLink,
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    pub relay: Arc<Relay>,
    pub config: RelayConfig,
    inbound: Option<mpsc::Receiver<LinkEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new(config: RelayConfig) -> Self {
        env_logger::try_init().ok();

        let link = MemoryLink::new();
        let inbound = link.setup_receiver(config.mqtt.inbound_capacity);
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_700_000_000_000);
        let sink = RecordingSink::new();

        let relay = Relay::new(
            &config,
            Arc::new(link.clone()),
            Arc::new(link.clone()),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        );

        Self {
            link,
            store,
            clock,
            sink,
            relay: Arc::new(relay),
            config,
            inbound: Some(inbound),
            tasks: Vec::new(),
        }
    }

    /// Phone relay reporting to the backend.
    pub fn phone() -> Self {
        Self::new(RelayConfig {
            node_id: PHONE_ID.into(),
            role: NodeRole::Phone,
            upstream_node: BACKEND_ID.into(),
            ..RelayConfig::default()
        })
    }

    /// Watch relay reporting to its phone.
    pub fn watch() -> Self {
        Self::new(RelayConfig {
            node_id: WATCH_ID.into(),
            display_name: "ShieldDrone watch".into(),
            role: NodeRole::Watch,
            upstream_node: PHONE_ID.into(),
            ..RelayConfig::default()
        })
    }

    /// Starts the inbound loop and the connection notices.
    pub fn start(&mut self) -> &mut Self {
        if let Some(inbound) = self.inbound.take() {
            self.tasks.push(self.relay.spawn_inbound_loop(inbound));
            self.tasks.push(self.relay.spawn_connection_notices(self.config.notice_duration()));
            log::info!("🚀 Relay {} started", self.config.node_id);
        }
        self
    }

    /// Also keeps the link up through the reconnect supervisor.
    pub fn supervise(&mut self) -> &mut Self {
        self.tasks.push(self.relay.spawn_supervisor(self.config.reconnect_policy()));
        self
    }

    pub async fn connect(&self) -> Result<()> {
        let state = self.relay.connection().connect().await;
        if !state.is_connected() {
            anyhow::bail!("Relay did not connect: {}", state);
        }
        Ok(())
    }

    /// Makes a node show up as reachable.
    pub fn pair(&self, node_id: &str) -> &Self {
        self.link.add_node(node_id, node_id);
        self
    }

    /// Injects an envelope as if `node_id` had sent it.
    pub fn send_from(&self, node_id: &str, envelope: &MessageEnvelope) -> Result<()> {
        self.link.simulate_envelope(node_id, envelope)?;
        log::info!("📨 {} from {}", envelope.tag(), node_id);
        Ok(())
    }

    /// Injects raw JSON, bypassing the codec.
    pub fn send_raw(&self, node_id: &str, topic: Topic, json: &Value) -> Result<()> {
        self.link.simulate_incoming(node_id, topic, serde_json::to_vec(json)?)?;
        Ok(())
    }

    pub fn send_bytes(&self, node_id: &str, topic: Topic, bytes: &[u8]) -> Result<()> {
        self.link.simulate_incoming(node_id, topic, bytes.to_vec())?;
        Ok(())
    }

    /// Everything decodable the relay sent to one node.
    pub fn envelopes_to(&self, node_id: &str) -> Vec<MessageEnvelope> {
        self.link
            .frames_to(node_id)
            .iter()
            .filter_map(|f| shieldrone_relay::decode(&f.bytes).ok())
            .collect()
    }

    /// Polls `condition` until it holds or `timeout_ms` of (tokio) time passes.
    pub async fn wait_until<F>(&self, timeout_ms: u64, condition: F) -> bool
    where
        F: Fn(&TestHarness) -> bool,
    {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("⏰ Condition not met within {}ms", timeout_ms);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits for at least `count` envelopes to `node_id`.
    pub async fn wait_for_envelopes(&self, node_id: &str, count: usize, timeout_ms: u64) -> Result<Vec<MessageEnvelope>> {
        if self.wait_until(timeout_ms, |h| h.envelopes_to(node_id).len() >= count).await {
            log::info!("✅ {} message(s) reached {}", count, node_id);
            return Ok(self.envelopes_to(node_id));
        }
        anyhow::bail!(
            "Expected {} message(s) to {}, got {}",
            count,
            node_id,
            self.envelopes_to(node_id).len()
        );
    }

    pub fn get_stats(&self) -> TestStats {
        let frames = self.link.sent_frames();
        let mut frames_per_node = HashMap::new();
        for frame in &frames {
            *frames_per_node.entry(frame.node_id.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_frames: frames.len(),
            frames_per_node,
            sink_events: self.sink.events().len(),
            connect_attempts: self.link.connect_attempts(),
        }
    }

    /// Forgets recorded frames and sink events, keeps the relay running.
    pub fn reset(&mut self) {
        self.link.clear();
        self.sink.clear();
        log::info!("🧹 Test harness reset");
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_frames: usize,
    pub frames_per_node: HashMap<String, usize>,
    pub sink_events: usize,
    pub connect_attempts: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Relay Statistics:");
        println!("  Frames sent: {}", self.total_frames);
        for (node, count) in &self.frames_per_node {
            println!("    {}: {} frames", node, count);
        }
        println!("  Sink events: {}", self.sink_events);
        println!("  Connect attempts: {}", self.connect_attempts);
    }
}

/// Declares a paused-time relay scenario on a started harness.
#[macro_export]
macro_rules! relay_test {
    ($name:ident, $harness:expr, |$h:ident| $body:block) => {
        #[tokio::test(start_paused = true)]
        async fn $name() {
            async fn scenario($h: &mut $crate::test_utils::TestHarness) -> anyhow::Result<()> $body

            let mut harness = $harness;
            harness.start();

            match scenario(&mut harness).await {
                Ok(_) => {
                    harness.get_stats().print();
                    println!("✅ Scenario '{}' passed", stringify!($name));
                }
                Err(e) => {
                    eprintln!("❌ Scenario '{}' failed: {}", stringify!($name), e);
                    panic!("Scenario failed: {}", e);
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{AssignmentBuilder, MessageBuilder};
    use crate::recording_sink::SinkEvent;
    use shieldrone_relay::models::{AlertTier, AssignmentCommand, HeartRateData, MatchStatus};
    use shieldrone_relay::{ConnectionState, DeliveryOutcome, Payload, RelayError, SendError};

    relay_test!(test_phone_relays_danger_alert_and_confirmation, TestHarness::phone(), |h| {
        h.connect().await?;
        h.pair(WATCH_ID);

        h.send_from(BACKEND_ID, &MessageBuilder::alert_envelope(AlertTier::Danger, 500))?;
        let to_watch = h.wait_for_envelopes(WATCH_ID, 1, 1_000).await?;
        assert!(matches!(to_watch[0].payload(), Payload::DangerAlert(a) if a.timestamp == 500));
        assert_eq!(h.sink.triggers(), vec![AlertTier::Danger]);

        // tier 3 stays until acknowledged
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.relay.dispatcher().is_active(AlertTier::Danger));

        let confirmation = h.relay.acknowledge_alert().await?.expect("pending danger alert");
        assert_eq!(confirmation.alert_timestamp, 500);
        let upstream = h.envelopes_to(BACKEND_ID);
        assert!(matches!(upstream.last().map(|e| e.payload()), Some(Payload::Safety(_))));
        assert_eq!(h.envelopes_to(WATCH_ID).len(), 2);
        assert_eq!(h.sink.dismissals(), vec![AlertTier::Danger]);
        Ok(())
    });

    relay_test!(test_advisory_and_warning_clear_themselves, TestHarness::phone(), |h| {
        h.send_from(BACKEND_ID, &MessageBuilder::alert_envelope(AlertTier::Advisory, 1))?;
        h.send_from(BACKEND_ID, &MessageBuilder::alert_envelope(AlertTier::Warning, 2))?;
        assert!(h.wait_until(500, |h| h.sink.triggers().len() == 2).await);

        tokio::time::sleep(Duration::from_millis(5_200)).await;
        let mut dismissed = h.sink.dismissals();
        dismissed.sort();
        assert_eq!(dismissed, vec![AlertTier::Advisory, AlertTier::Warning]);
        assert!(h.relay.dispatcher().active_alerts().is_empty());
        Ok(())
    });

    relay_test!(test_duplicate_delivery_shows_once, TestHarness::phone(), |h| {
        h.connect().await?;
        h.pair(WATCH_ID);
        let alert = MessageBuilder::alert_envelope(AlertTier::Danger, 900);
        h.send_from(BACKEND_ID, &alert)?;
        h.send_from(BACKEND_ID, &alert)?;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.sink.triggers().len(), 1);
        assert_eq!(h.envelopes_to(WATCH_ID).len(), 1);
        Ok(())
    });

    relay_test!(test_slow_watch_does_not_hold_back_the_others, TestHarness::phone(), |h| {
        h.connect().await?;
        for node in ["watch-1", "watch-2", "watch-3"] {
            h.pair(node);
        }
        h.link.hang_node("watch-2");

        let report = h
            .relay
            .dispatcher()
            .handle_alert(MessageBuilder::alert(AlertTier::Danger, 77), Some(BACKEND_ID))
            .await;
        assert_eq!(report.fan_out.deliveries().len(), 3);
        assert_eq!(report.fan_out.delivered_count(), 2);
        let slow = report.fan_out.deliveries().iter().find(|d| d.node_id == "watch-2");
        assert_eq!(slow.map(|d| d.outcome.clone()), Some(DeliveryOutcome::TimedOut));
        assert!(h.relay.connection().is_connected());
        Ok(())
    });

    relay_test!(test_assignment_cycle_and_expiry, TestHarness::phone(), |h| {
        h.connect().await?;
        let assigned = AssignmentBuilder::new(42, MatchStatus::Assigned).station_ip("10.0.0.42").battery(90);
        h.send_from(BACKEND_ID, &assigned.envelope())?;
        assert!(h.wait_until(500, |h| h.relay.store().started_at().ok().flatten().is_some()).await);

        let progress = AssignmentBuilder::new(42, MatchStatus::Assigned).estimated_time(180);
        h.send_from(BACKEND_ID, &progress.envelope())?;
        assert!(h.wait_until(500, |h| h.relay.store().get().ok().flatten().and_then(|s| s.estimated_time).is_some()).await);

        let stored = h.relay.store().get()?.expect("assignment stored");
        assert_eq!(stored.station_ip.as_deref(), Some("10.0.0.42"));
        assert_eq!(stored.battery, Some(90));

        h.clock.advance(Duration::from_secs(10 * 60));
        let expired = h.relay.expire_assignment_if_due().await.expect("timer ran out");
        assert_eq!(expired.drone_id, 42);
        assert!(h.relay.store().get()?.is_none());

        let cancel = h.envelopes_to(BACKEND_ID);
        assert!(matches!(
            cancel.last().map(|e| e.payload()),
            Some(Payload::Command(AssignmentCommand::Cancel(c))) if c.drone_id == 42
        ));
        Ok(())
    });

    relay_test!(test_send_while_disconnected_reconnects_once, TestHarness::watch(), |h| {
        let result = h.relay.send_heart_rate(HeartRateData { bpm: 101.0, pulse_flag: false, timestamp: 1 }).await;
        assert!(matches!(result, Err(RelayError::Send(SendError::NotConnected))));

        assert!(h.wait_until(500, |h| h.relay.connection().is_connected()).await);
        assert_eq!(h.link.connect_attempts(), 1);
        assert!(h.link.sent_frames().is_empty());
        Ok(())
    });

    relay_test!(test_concurrent_reconnects_collapse, TestHarness::phone(), |h| {
        h.link.set_connect_delay(Duration::from_millis(300));
        let conn = h.relay.connection().clone();
        let (a, b) = tokio::join!(conn.reconnect(), conn.reconnect());
        assert_eq!(a, ConnectionState::Connected);
        assert_eq!(b, ConnectionState::Connected);
        assert_eq!(h.link.connect_attempts(), 1);
        Ok(())
    });

    relay_test!(test_broker_drop_recovers_and_notifies, TestHarness::phone(), |h| {
        h.supervise();
        h.connect().await?;
        h.link.simulate_drop("keep-alive timeout")?;

        assert!(h.wait_until(500, |h| !h.relay.connection().is_connected()).await);
        assert!(h.wait_until(10_000, |h| h.relay.connection().is_connected()).await);
        assert_eq!(h.link.connect_attempts(), 2);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert!(h.sink.notices().iter().any(|s| matches!(s, ConnectionState::Error(_))));
        assert_eq!(h.sink.notices().last(), Some(&ConnectionState::Connected));
        assert_eq!(h.sink.events().last(), Some(&SinkEvent::NoticeHidden));
        Ok(())
    });

    relay_test!(test_garbage_does_not_stop_the_inbound_loop, TestHarness::phone(), |h| {
        h.send_bytes(BACKEND_ID, Topic::DangerAlert, b"\x00\x01 not json")?;
        h.send_raw(BACKEND_ID, Topic::Control, &MessageBuilder::raw("droneTelemetry", serde_json::json!({"alt": 30})))?;
        h.send_raw(BACKEND_ID, Topic::DangerAlert, &MessageBuilder::raw_warning(1, true, 64))?;

        assert!(h.wait_until(500, |h| h.sink.triggers() == vec![AlertTier::Advisory]).await);
        assert_eq!(h.relay.health().report(h.relay.connection()).decode_faults, 1);
        Ok(())
    });

    relay_test!(test_watch_displays_but_does_not_forward, TestHarness::watch(), |h| {
        h.connect().await?;
        h.pair(PHONE_ID);
        h.pair("watch-9");

        h.send_from(PHONE_ID, &MessageBuilder::alert_envelope(AlertTier::Danger, 321))?;
        assert!(h.wait_until(500, |h| h.sink.triggers() == vec![AlertTier::Danger]).await);
        assert!(h.link.sent_frames().is_empty());

        h.relay.acknowledge_alert().await?;
        let to_phone = h.envelopes_to(PHONE_ID);
        assert_eq!(to_phone.len(), 1);
        assert!(matches!(to_phone[0].payload(), Payload::Safety(c) if c.alert_timestamp == 321));
        assert!(h.envelopes_to("watch-9").is_empty());
        Ok(())
    });

    relay_test!(test_phone_forwards_watch_sensors, TestHarness::phone(), |h| {
        h.connect().await?;
        h.send_from(WATCH_ID, &MessageBuilder::heart_rate(131.0, true))?;
        h.send_from(WATCH_ID, &MessageBuilder::audio(88.5, true))?;

        let upstream = h.wait_for_envelopes(BACKEND_ID, 2, 1_000).await?;
        let tags: Vec<&str> = upstream.iter().map(|e| e.tag()).collect();
        assert!(tags.contains(&"heartRate"));
        assert!(tags.contains(&"audio"));
        Ok(())
    });

    #[tokio::test(start_paused = true)]
    async fn test_harness_reset() {
        let mut harness = TestHarness::phone();
        harness.start();
        harness.connect().await.unwrap();
        harness.relay.send_audio(shieldrone_relay::models::AudioData {
            average_db: 60.0,
            danger_flag: false,
            timestamp: 1,
        })
        .await
        .unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.total_frames, 1);
        assert_eq!(stats.frames_per_node.get(BACKEND_ID), Some(&1));

        harness.reset();
        assert_eq!(harness.get_stats().total_frames, 0);
    }
}
