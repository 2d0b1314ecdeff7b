//! Publishing messages.
//!
//! The producer resolves where a message goes before calling the PUBLISH
//! script: one copy for a POINT_TO_POINT queue, one per consumer group for a
//! PUB_SUB queue (or only the group the message names). A message with a
//! schedule is published into the scheduled set instead of pending.
//!
//! # Examples
//!
//! ```rust,no_run
//! use smithymq::prelude::*;
//! use serde_json::json;
//!
//! # async fn example(smithy: Smithy) -> SmithyResult<()> {
//! let queue: QueueParams = "orders@shop".parse()?;
//! let ids = smithy
//!     .producer()
//!     .produce(ProducibleMessage::new(json!({"order": 42})).set_queue(queue))
//!     .await?;
//! assert_eq!(ids.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use crate::message::{MessageDestination, MessageEnvelope, MessageId, ProducibleMessage};
use crate::queue::{DeliveryModel, QueueManager, QueueParams, QueueProperties, QueueType};
use crate::storage::{MessageStorage, PublishTarget};
use crate::utils::now_ms;

/// Publishes messages to queues
#[derive(Clone)]
pub struct Producer {
    storage: MessageStorage,
    queues: QueueManager,
    events: SharedEventBus,
}

/// Priority must be set on PRIORITY queues and only there
fn check_priority(queue: &QueueParams, queue_type: QueueType, priority: Option<u8>) -> SmithyResult<()> {
    match (queue_type.is_priority(), priority) {
        (true, None) => Err(SmithyError::invalid_message(format!(
            "a priority is required by PRIORITY queue '{}'",
            queue
        ))),
        (false, Some(_)) => Err(SmithyError::invalid_message(format!(
            "queue '{}' is not a PRIORITY queue",
            queue
        ))),
        _ => Ok(()),
    }
}

/// One target per copy of the message
fn resolve_targets(
    destination: &MessageDestination,
    properties: &QueueProperties,
    consumer_groups: &[String],
) -> SmithyResult<Vec<PublishTarget>> {
    let queue = &destination.queue;
    match (properties.delivery_model, destination.consumer_group.as_deref()) {
        (DeliveryModel::PointToPoint, None) => Ok(vec![PublishTarget {
            id: MessageId::generate(),
            consumer_group: None,
        }]),
        (DeliveryModel::PointToPoint, Some(_)) => Err(SmithyError::ConsumerGroupsNotSupported {
            queue: queue.to_string(),
        }),
        (DeliveryModel::PubSub, Some(group)) => {
            if !consumer_groups.iter().any(|g| g == group) {
                return Err(SmithyError::ConsumerGroupNotFound {
                    group: group.to_string(),
                });
            }
            Ok(vec![PublishTarget {
                id: MessageId::generate(),
                consumer_group: Some(group.to_string()),
            }])
        }
        (DeliveryModel::PubSub, None) => {
            if consumer_groups.is_empty() {
                return Err(SmithyError::QueueHasNoConsumerGroups {
                    queue: queue.to_string(),
                });
            }
            Ok(consumer_groups
                .iter()
                .map(|group| PublishTarget {
                    id: MessageId::generate(),
                    consumer_group: Some(group.clone()),
                })
                .collect())
        }
    }
}

impl Producer {
    /// Create a producer
    pub fn new(storage: MessageStorage, queues: QueueManager, events: SharedEventBus) -> Self {
        Self {
            storage,
            queues,
            events,
        }
    }

    /// Publish a message; returns the id of every created copy
    pub async fn produce(&self, message: ProducibleMessage) -> SmithyResult<Vec<MessageId>> {
        message.validate()?;
        let destination = message
            .destination
            .clone()
            .ok_or_else(|| SmithyError::invalid_message("destination queue is required"))?;
        let queue = destination.queue.clone();

        let properties = self.queues.get_properties(&queue).await?;
        check_priority(&queue, properties.queue_type, message.priority)?;
        let consumer_groups = match properties.delivery_model {
            DeliveryModel::PubSub => self.queues.get_consumer_groups(&queue).await?,
            DeliveryModel::PointToPoint => Vec::new(),
        };
        let targets = resolve_targets(&destination, &properties, &consumer_groups)?;

        let scheduled_at = match &message.schedule {
            Some(schedule) => Some(schedule.next_timestamp(0, now_ms())?.ok_or_else(|| {
                SmithyError::invalid_message("schedule has no upcoming delivery")
            })?),
            None => None,
        };

        let envelope = MessageEnvelope::new(MessageId::generate(), message, destination);
        let ids = self
            .storage
            .publish(&envelope, properties.queue_type, &targets, scheduled_at)
            .await?;

        for target in targets.iter().filter(|t| ids.contains(&t.id)) {
            self.events.emit(SmithyEvent::MessagePublished {
                queue: queue.clone(),
                message_id: target.id.clone(),
                consumer_group: target.consumer_group.clone(),
                scheduled: scheduled_at.is_some(),
            });
        }
        tracing::debug!(queue = %queue, "published {} message(s)", ids.len());
        Ok(ids)
    }

    /// Publish a copy of the message to every queue bound to a fanout
    /// exchange of namespace `ns`
    pub async fn produce_to_fanout_exchange(
        &self,
        ns: &str,
        exchange: &str,
        message: ProducibleMessage,
    ) -> SmithyResult<Vec<MessageId>> {
        let queues = self.queues.get_exchange_queues(ns, exchange).await?;
        if queues.is_empty() {
            return Err(SmithyError::ExchangeBinding {
                message: format!("no queue is bound to exchange '{}'", exchange),
            });
        }

        let mut ids = Vec::new();
        for queue in queues {
            let copy = ProducibleMessage {
                destination: None,
                ..message.clone()
            }
            .set_queue(queue);
            ids.extend(self.produce(copy).await?);
        }
        Ok(ids)
    }
}
