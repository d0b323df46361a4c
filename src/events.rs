//! Typed in-process event channel between funnel producers and the
//! analytics forwarder.

use crate::models::{PopupConfig, TriggerSource, Variant};
use serde::Serialize;
use tokio::sync::broadcast;

/// A/B tracking event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbEventKind {
    Impression,
    Conversion,
}

impl AbEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AbEventKind::Impression => "impression",
            AbEventKind::Conversion => "conversion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FunnelEvent {
    /// A lead left the client. `server_success` is false when retries were
    /// exhausted and the UI was told it worked anyway.
    LeadCaptured {
        phone: String,
        source: Option<String>,
        campaign: Option<String>,
        stage: Option<u8>,
        server_success: bool,
        timestamp: i64,
    },
    /// Delivery gave up; the payload went to the failed-lead outbox.
    LeadDeliveryFailed {
        phone: String,
        error: String,
        timestamp: i64,
    },
    PopupTriggered {
        source: TriggerSource,
        config: PopupConfig,
    },
    AbEvent {
        test_id: String,
        variant: Variant,
        kind: AbEventKind,
        timestamp: i64,
    },
    ScrollDepth {
        percentage: u8,
    },
}

impl FunnelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FunnelEvent::LeadCaptured { .. } => "lead_captured",
            FunnelEvent::LeadDeliveryFailed { .. } => "lead_delivery_failed",
            FunnelEvent::PopupTriggered { .. } => "popup_triggered",
            FunnelEvent::AbEvent { .. } => "ab_event",
            FunnelEvent::ScrollDepth { .. } => "scroll_depth",
        }
    }
}

/// Broadcast bus; every subscriber sees every event published after it
/// subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes without blocking. Having no subscribers is not an error.
    pub fn publish(&self, event: FunnelEvent) {
        tracing::debug!("Publishing funnel event: {}", event.name());
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FunnelEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drains every event currently queued on `receiver` without waiting.
pub fn drain(receiver: &mut broadcast::Receiver<FunnelEvent>) -> Vec<FunnelEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!("Event receiver lagged, skipped {} events", skipped);
            }
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(FunnelEvent::ScrollDepth { percentage: 25 });
    }

    #[test]
    fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(FunnelEvent::ScrollDepth { percentage: 25 });
        bus.publish(FunnelEvent::ScrollDepth { percentage: 50 });

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                FunnelEvent::ScrollDepth { percentage: 25 },
                FunnelEvent::ScrollDepth { percentage: 50 },
            ]
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(FunnelEvent::ScrollDepth { percentage: 75 }).unwrap();
        assert_eq!(json["event"], "scroll_depth");
        assert_eq!(json["percentage"], 75);
    }
}
