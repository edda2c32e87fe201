use crate::connection::ConnectionManager;
use crate::dispatcher::AlertSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_NOTICE_DURATION: Duration = Duration::from_secs(3);

/// Shows every connection state change on the sink and hides the notice
/// `hide_after` later. A new change restarts the countdown.
pub fn spawn_connection_notices(
    connection: &ConnectionManager,
    sink: Arc<dyn AlertSink>,
    hide_after: Duration,
) -> JoinHandle<()> {
    let mut states = connection.subscribe();

    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    sink.connection_notice(&state);
                    deadline = Some(Instant::now() + hide_after);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("[notice] hiding connection notice");
                    sink.hide_connection_notice();
                    deadline = None;
                }
            }
        }
    })
}
