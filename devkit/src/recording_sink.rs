/*!
Recording UI sink

Stands in for the screen and the notification manager: every call the relay
makes is kept in order so tests can assert on what the user would have seen.
*/

use shieldrone_relay::models::AlertTier;
use shieldrone_relay::{AlertSink, ConnectionState};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Triggered { tier: AlertTier, warning_flag: bool },
    Dismissed(AlertTier),
    Notice(ConnectionState),
    NoticeHidden,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SinkEvent) {
        log::debug!("🖥️ sink: {:?}", event);
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Tiers triggered, in order.
    pub fn triggers(&self) -> Vec<AlertTier> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Triggered { tier, .. } => Some(tier),
                _ => None,
            })
            .collect()
    }

    pub fn dismissals(&self) -> Vec<AlertTier> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Dismissed(tier) => Some(tier),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<ConnectionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Notice(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Whether a connection notice is on screen right now.
    pub fn notice_visible(&self) -> bool {
        self.events()
            .iter()
            .rev()
            .find(|e| matches!(e, SinkEvent::Notice(_) | SinkEvent::NoticeHidden))
            .is_some_and(|e| matches!(e, SinkEvent::Notice(_)))
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl AlertSink for RecordingSink {
    fn trigger(&self, tier: AlertTier, warning_flag: bool) {
        self.push(SinkEvent::Triggered { tier, warning_flag });
    }

    fn dismiss(&self, tier: AlertTier) {
        self.push(SinkEvent::Dismissed(tier));
    }

    fn connection_notice(&self, state: &ConnectionState) {
        self.push(SinkEvent::Notice(state.clone()));
    }

    fn hide_connection_notice(&self) {
        self.push(SinkEvent::NoticeHidden);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.trigger(AlertTier::Warning, true);
        sink.connection_notice(&ConnectionState::Connected);
        sink.dismiss(AlertTier::Warning);

        assert_eq!(sink.triggers(), vec![AlertTier::Warning]);
        assert_eq!(sink.dismissals(), vec![AlertTier::Warning]);
        assert!(sink.notice_visible());

        sink.hide_connection_notice();
        assert!(!sink.notice_visible());
        assert_eq!(sink.events().len(), 4);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
