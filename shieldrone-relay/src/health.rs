use crate::codec::Payload;
use crate::connection::ConnectionManager;
use crate::models::HealthReport;
use crate::sender::OutboundSender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Counters {
    alerts_dispatched: AtomicU64,
    deliveries_failed: AtomicU64,
    decode_faults: AtomicU64,
}

/// Relay counters, cheap to clone and share between tasks.
#[derive(Clone)]
pub struct HealthTracker {
    node_id: String,
    start_time: Instant,
    counters: Arc<Counters>,
}

impl HealthTracker {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn record_alert(&self) {
        self.counters.alerts_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_delivery(&self) {
        self.counters.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_fault(&self) {
        self.counters.decode_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self, connection: &ConnectionManager) -> HealthReport {
        HealthReport {
            node_id: self.node_id.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connection: connection.state().label().to_string(),
            reconnects: connection.reconnect_count(),
            alerts_dispatched: self.counters.alerts_dispatched.load(Ordering::Relaxed),
            deliveries_failed: self.counters.deliveries_failed.load(Ordering::Relaxed),
            decode_faults: self.counters.decode_faults.load(Ordering::Relaxed),
        }
    }

    /// Publishes a `relayHealth` report upstream every `every`.
    /// Skips silently while the link is down rather than triggering reconnects.
    pub fn spawn_health_publisher(
        &self,
        connection: Arc<ConnectionManager>,
        sender: OutboundSender,
        every: Duration,
    ) -> JoinHandle<()> {
        let tracker = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // first tick is immediate
            interval.tick().await;

            loop {
                interval.tick().await;
                if !connection.is_connected() {
                    continue;
                }
                let report = tracker.report(&connection);
                match sender.send(Payload::Health(report.clone())).await {
                    Ok(()) => debug!(
                        "[health] published relay health (uptime: {}s, alerts: {})",
                        report.uptime_seconds, report.alerts_dispatched
                    ),
                    Err(e) => warn!("[health] failed to publish: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::store::ManualClock;
    use crate::topics::Topic;

    #[tokio::test(start_paused = true)]
    async fn test_publisher_reports_counters_upstream() {
        let link = MemoryLink::new();
        let conn = Arc::new(ConnectionManager::new(Arc::new(link.clone()), Duration::from_secs(5)));
        let sender = OutboundSender::new(conn.clone(), Arc::new(ManualClock::new(0)), "backend", Duration::from_secs(5));
        conn.connect().await;

        let health = HealthTracker::new("phone-1");
        health.record_alert();
        health.record_alert();
        health.record_decode_fault();
        let task = health.spawn_health_publisher(conn.clone(), sender, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let published = link.envelopes_on(Topic::Control);
        assert_eq!(published.len(), 1);
        match published[0].payload() {
            Payload::Health(report) => {
                assert_eq!(report.node_id, "phone-1");
                assert_eq!(report.connection, "connected");
                assert_eq!(report.alerts_dispatched, 2);
                assert_eq!(report.decode_faults, 1);
                assert_eq!(report.deliveries_failed, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_stays_quiet_while_disconnected() {
        let link = MemoryLink::new();
        let conn = Arc::new(ConnectionManager::new(Arc::new(link.clone()), Duration::from_secs(5)));
        let sender = OutboundSender::new(conn.clone(), Arc::new(ManualClock::new(0)), "backend", Duration::from_secs(5));

        let task = HealthTracker::new("watch-1").spawn_health_publisher(conn, sender, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(link.connect_attempts(), 0);
        assert!(link.sent_frames().is_empty());
        task.abort();
    }
}
