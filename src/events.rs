//! Domain events.
//!
//! Components emit events through an injected [`EventBus`]. Emission is
//! synchronous and must not fail the operation that triggered it.

use crate::message::{MessageId, UnacknowledgeOutcome, UnacknowledgeReason};
use crate::queue::{QueueOperationalState, QueueParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Something that happened to a message, a queue or a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SmithyEvent {
    #[serde(rename_all = "camelCase")]
    MessagePublished {
        queue: QueueParams,
        message_id: MessageId,
        consumer_group: Option<String>,
        scheduled: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessageAcknowledged {
        queue: QueueParams,
        message_id: MessageId,
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageUnacknowledged {
        queue: QueueParams,
        message_id: MessageId,
        consumer_id: String,
        reason: UnacknowledgeReason,
        outcome: UnacknowledgeOutcome,
    },
    #[serde(rename_all = "camelCase")]
    MessageDeadLettered {
        queue: QueueParams,
        message_id: MessageId,
        reason: UnacknowledgeReason,
    },
    #[serde(rename_all = "camelCase")]
    MessageRequeued {
        queue: QueueParams,
        message_id: MessageId,
        original_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MessageDelayed {
        queue: QueueParams,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MessageScheduled {
        queue: QueueParams,
        message_id: MessageId,
        parent_id: Option<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    QueueCreated { queue: QueueParams },
    #[serde(rename_all = "camelCase")]
    QueueDeleted { queue: QueueParams },
    #[serde(rename_all = "camelCase")]
    ConsumerGroupCreated {
        queue: QueueParams,
        consumer_group: String,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerGroupDeleted {
        queue: QueueParams,
        consumer_group: String,
    },
    #[serde(rename_all = "camelCase")]
    QueueStateChanged {
        queue: QueueParams,
        from: QueueOperationalState,
        to: QueueOperationalState,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerOffline { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    WorkerCrashed { worker: String, error: String },
}

impl SmithyEvent {
    /// Event name, e.g. `messageAcknowledged`
    pub fn name(&self) -> &'static str {
        match self {
            SmithyEvent::MessagePublished { .. } => "messagePublished",
            SmithyEvent::MessageAcknowledged { .. } => "messageAcknowledged",
            SmithyEvent::MessageUnacknowledged { .. } => "messageUnacknowledged",
            SmithyEvent::MessageDeadLettered { .. } => "messageDeadLettered",
            SmithyEvent::MessageRequeued { .. } => "messageRequeued",
            SmithyEvent::MessageDelayed { .. } => "messageDelayed",
            SmithyEvent::MessageScheduled { .. } => "messageScheduled",
            SmithyEvent::QueueCreated { .. } => "queueCreated",
            SmithyEvent::QueueDeleted { .. } => "queueDeleted",
            SmithyEvent::ConsumerGroupCreated { .. } => "consumerGroupCreated",
            SmithyEvent::ConsumerGroupDeleted { .. } => "consumerGroupDeleted",
            SmithyEvent::QueueStateChanged { .. } => "queueStateChanged",
            SmithyEvent::ConsumerOffline { .. } => "consumerOffline",
            SmithyEvent::WorkerCrashed { .. } => "workerCrashed",
        }
    }
}

/// Sink for domain events
pub trait EventBus: Send + Sync {
    /// Publish an event
    fn emit(&self, event: SmithyEvent);
}

/// Shared event bus handle
pub type SharedEventBus = Arc<dyn EventBus>;

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn emit(&self, event: SmithyEvent) {
        tracing::trace!(event = event.name(), "event dropped");
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lose the oldest events, never block emitters.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<SmithyEvent>,
}

impl BroadcastEventBus {
    /// Create a bus keeping up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SmithyEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: SmithyEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// A bus that drops everything
pub fn noop() -> SharedEventBus {
    Arc::new(NoopEventBus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> QueueParams {
        QueueParams::new("orders", "shop").unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(SmithyEvent::QueueCreated { queue: orders() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "queueCreated");
        assert_eq!(event, SmithyEvent::QueueCreated { queue: orders() });
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = BroadcastEventBus::new(1);
        bus.emit(SmithyEvent::ConsumerOffline {
            consumer_id: "c1".into(),
        });
        noop().emit(SmithyEvent::QueueDeleted { queue: orders() });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SmithyEvent::MessageRequeued {
            queue: orders(),
            message_id: MessageId::from("new"),
            original_id: MessageId::from("old"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "messageRequeued");
        assert_eq!(json["originalId"], "old");
    }
}
