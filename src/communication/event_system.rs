use forge_shared::BroadcastEvent;
use forge_shared::event_interface::{EventError, EventSink};
use tokio::sync::broadcast;

/// A topic-tagged event as seen by subscribers.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub event: BroadcastEvent,
}

/// Tokio broadcast-based event bus.
#[derive(Debug, Clone)]
pub struct TokioEventSystem {
    sender: broadcast::Sender<TopicEvent>,
}

impl TokioEventSystem {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for TokioEventSystem {
    fn emit(&self, topic: &str, event: BroadcastEvent) -> Result<(), EventError> {
        let message = TopicEvent {
            topic: topic.to_string(),
            event,
        };
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| EventError::NoSubscribers(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_shared::EventKind;

    #[tokio::test]
    async fn subscribers_receive_topic_events() {
        let bus = TokioEventSystem::new(8);
        let mut rx = bus.subscribe();
        let event = BroadcastEvent {
            uuid: "abc".to_string(),
            event: EventKind::New,
            data: serde_json::json!({ "state": "ready" }),
        };
        bus.emit("jobs", event.clone()).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "jobs");
        assert_eq!(received.event, event);
    }

    #[test]
    fn emit_without_subscribers_reports_error() {
        let bus = TokioEventSystem::new(8);
        let event = BroadcastEvent {
            uuid: "abc".to_string(),
            event: EventKind::Delete,
            data: serde_json::Value::Null,
        };
        assert!(matches!(bus.emit("jobs", event), Err(EventError::NoSubscribers(_))));
    }
}
