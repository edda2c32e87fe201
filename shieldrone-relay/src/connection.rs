/*!
 * CONNECTION STATE MACHINE - Link lifecycle owner
 *
 * ROLE :
 * Sole writer of `ConnectionState`. Everything else only subscribes.
 * Disconnected -> Connecting -> Connected, with Error(cause) on any fault.
 *
 * RULES :
 * - transport faults never escape: they become Error states
 * - `reconnect()` is coalesced, concurrent callers join the attempt in flight
 * - every connect is bounded by `connect_timeout`
 */

use crate::link::{LinkError, TransportLink};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionFault {
    #[error("link establish failed: {0}")]
    Establish(String),
    #[error("link teardown failed: {0}")]
    Teardown(String),
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    #[error("link lost: {0}")]
    LinkLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(ConnectionFault),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(fault) => write!(f, "error ({fault})"),
            other => f.write_str(other.label()),
        }
    }
}

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);

/// Exponential backoff between supervised reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0-based), never below 1 ms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .max(MIN_RECONNECT_DELAY)
    }
}

pub struct ConnectionManager {
    link: Arc<dyn TransportLink>,
    state_tx: watch::Sender<ConnectionState>,
    gate: AsyncMutex<()>,
    reconnect_generation: AtomicU64,
    reconnects: AtomicU64,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn TransportLink>, connect_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            state_tx,
            gate: AsyncMutex::new(()),
            reconnect_generation: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connect_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// Read-only view of state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn link(&self) -> &Arc<dyn TransportLink> {
        &self.link
    }

    /// Completed reconnect attempts since start.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn publish(&self, state: ConnectionState) {
        debug!("[connection] state -> {}", state);
        self.state_tx.send_replace(state);
    }

    pub async fn connect(&self) -> ConnectionState {
        let _gate = self.gate.lock().await;
        self.connect_locked().await
    }

    pub async fn disconnect(&self) -> ConnectionState {
        let _gate = self.gate.lock().await;
        self.disconnect_locked().await
    }

    /// disconnect + connect. A caller arriving while another reconnect runs
    /// waits for it and returns its outcome instead of starting a second one.
    pub async fn reconnect(&self) -> ConnectionState {
        let observed = self.reconnect_generation.load(Ordering::SeqCst);
        self.reconnect_from(observed).await
    }

    async fn reconnect_from(&self, observed: u64) -> ConnectionState {
        let _gate = self.gate.lock().await;
        if self.reconnect_generation.load(Ordering::SeqCst) != observed {
            debug!("[connection] joined in-flight reconnect");
            return self.state();
        }

        info!("[connection] reconnecting...");
        self.disconnect_locked().await;
        let outcome = self.connect_locked().await;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.reconnect_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Fire-and-forget reconnect. Triggers issued while an attempt is pending
    /// collapse into that attempt.
    pub fn trigger_reconnect(self: &Arc<Self>) -> JoinHandle<ConnectionState> {
        let observed = self.reconnect_generation.load(Ordering::SeqCst);
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconnect_from(observed).await })
    }

    /// The transport reported an unsolicited drop of `session`. Drops from a
    /// session that was already replaced are ignored. Returns whether the
    /// state changed.
    pub async fn report_link_lost(&self, session: u64, cause: &str) -> bool {
        let _gate = self.gate.lock().await;
        let current = self.link.session();
        if session != current {
            debug!("[connection] ignoring drop of session {} (current: {}): {}", session, current, cause);
            return false;
        }

        warn!("[connection] link lost: {}", cause);
        self.publish(ConnectionState::Error(ConnectionFault::LinkLost(cause.to_string())));
        true
    }

    async fn connect_locked(&self) -> ConnectionState {
        self.publish(ConnectionState::Connecting);

        let outcome = match tokio::time::timeout(self.connect_timeout, self.link.connect()).await {
            Ok(Ok(())) => ConnectionState::Connected,
            Ok(Err(e)) => {
                warn!("[connection] connect failed: {}", e);
                ConnectionState::Error(ConnectionFault::Establish(e.to_string()))
            }
            Err(_) => {
                warn!("[connection] connect timed out after {:?}", self.connect_timeout);
                ConnectionState::Error(ConnectionFault::TimedOut(self.connect_timeout))
            }
        };

        self.publish(outcome.clone());
        outcome
    }

    async fn disconnect_locked(&self) -> ConnectionState {
        match tokio::time::timeout(self.connect_timeout, self.link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[connection] {}", ConnectionFault::Teardown(e.to_string())),
            Err(_) => warn!("[connection] {}", ConnectionFault::Teardown(LinkError::Closed.to_string())),
        }
        self.publish(ConnectionState::Disconnected);
        ConnectionState::Disconnected
    }

    /// Reconnects with backoff after every Error state, resets on Connected.
    pub fn spawn_supervisor(self: &Arc<Self>, policy: ReconnectPolicy) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut states = self.subscribe();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let current = states.borrow_and_update().clone();
                match current {
                    ConnectionState::Error(fault) => {
                        let delay = policy.delay_for(attempt);
                        info!("[connection] {}; retrying in {:?}", fault, delay);
                        tokio::time::sleep(delay).await;
                        attempt = attempt.saturating_add(1);
                        manager.trigger_reconnect();
                    }
                    ConnectionState::Connected => attempt = 0,
                    _ => {}
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;

    fn manager(link: &MemoryLink) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(Arc::new(link.clone()), Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_connect_success_broadcasts_connected() {
        let link = MemoryLink::new();
        let conn = manager(&link);
        let mut rx = conn.subscribe();

        assert_eq!(conn.connect().await, ConnectionState::Connected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_becomes_error_state() {
        let link = MemoryLink::new();
        link.fail_connect(Some("no route to broker"));
        let conn = manager(&link);

        match conn.connect().await {
            ConnectionState::Error(ConnectionFault::Establish(msg)) => assert!(msg.contains("no route")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_bounded() {
        let link = MemoryLink::new();
        link.hang_connect(true);
        let conn = manager(&link);

        assert_eq!(
            conn.connect().await,
            ConnectionState::Error(ConnectionFault::TimedOut(Duration::from_secs(5)))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = MemoryLink::new();
        let conn = manager(&link);

        assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
        conn.connect().await;
        assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
        assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reconnects_share_one_attempt() {
        let link = MemoryLink::new();
        link.set_connect_delay(Duration::from_millis(200));
        let conn = manager(&link);

        let connected_seen = Arc::new(AtomicU64::new(0));
        let mut rx = conn.subscribe();
        let observer = {
            let connected_seen = connected_seen.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    if rx.borrow_and_update().is_connected() {
                        connected_seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };

        let (a, b) = tokio::join!(conn.reconnect(), conn.reconnect());
        assert_eq!(a, ConnectionState::Connected);
        assert_eq!(b, ConnectionState::Connected);
        assert_eq!(link.connect_attempts(), 1);
        assert_eq!(conn.reconnect_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connected_seen.load(Ordering::SeqCst), 1);
        observer.abort();
    }

    #[tokio::test]
    async fn test_drop_from_replaced_session_is_ignored() {
        let link = MemoryLink::new();
        let conn = manager(&link);
        conn.connect().await;
        let old_session = link.session();

        conn.reconnect().await;
        assert_ne!(link.session(), old_session);

        assert!(!conn.report_link_lost(old_session, "old session keep-alive timeout").await);
        assert_eq!(conn.state(), ConnectionState::Connected);

        assert!(conn.report_link_lost(link.session(), "broker gone").await);
        assert!(matches!(conn.state(), ConnectionState::Error(ConnectionFault::LinkLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_reconnects_coalesce() {
        let link = MemoryLink::new();
        link.set_connect_delay(Duration::from_millis(50));
        let conn = manager(&link);

        let first = conn.trigger_reconnect();
        let second = conn.trigger_reconnect();
        assert_eq!(first.await.unwrap(), ConnectionState::Connected);
        assert_eq!(second.await.unwrap(), ConnectionState::Connected);
        assert_eq!(link.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_recovers_after_link_loss() {
        let link = MemoryLink::new();
        let conn = manager(&link);
        conn.connect().await;
        let supervisor = conn.spawn_supervisor(ReconnectPolicy::default());

        conn.report_link_lost(link.session(), "broker restarted").await;
        assert!(!conn.is_connected());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(conn.is_connected());
        assert_eq!(link.connect_attempts(), 2);
        supervisor.abort();
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));

        let eager = ReconnectPolicy { initial_delay: Duration::ZERO, ..ReconnectPolicy::default() };
        assert_eq!(eager.delay_for(0), MIN_RECONNECT_DELAY);
    }
}
