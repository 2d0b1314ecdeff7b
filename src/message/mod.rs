//! Messages: the producible part set by producers, and the persisted envelope.
//!
//! A message hash is flat so Lua scripts can read and update single fields:
//! the producible settings the scripts need (ttl, retry settings, priority)
//! are written as their own fields next to the full producible JSON, and the
//! lifecycle state is spread over the fields listed in [`state::fields`].
//!
//! # Examples
//!
//! ```rust
//! use smithymq::message::ProducibleMessage;
//! use smithymq::queue::QueueParams;
//! use serde_json::json;
//!
//! let message = ProducibleMessage::new(json!({"order": 42}))
//!     .set_queue(QueueParams::new("orders", "shop").unwrap())
//!     .set_retry_threshold(5)
//!     .set_priority(1);
//! assert!(message.validate().is_ok());
//! ```

use crate::error::{SmithyError, SmithyResult};
use crate::queue::{QueueParams, validate_name};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod manager;
pub mod schedule;
pub mod state;
pub mod status;

pub use manager::{DeleteMessagesReply, DeleteMessagesStats, DeleteStatus, MessageManager, MessagePage};
pub use schedule::MessageSchedule;
pub use state::MessageState;
pub use status::{MessageStatus, UnacknowledgeOutcome, UnacknowledgeReason};

/// Field names of the message hash, besides the state fields.
pub mod fields {
    pub const ID: &str = "id";
    pub const STATUS: &str = "status";
    pub const MESSAGE: &str = "message";
    pub const QUEUE: &str = "queue";
    pub const CONSUMER_GROUP_ID: &str = "consumerGroupId";
    pub const TTL: &str = "ttl";
    pub const RETRY_THRESHOLD: &str = "retryThreshold";
    pub const RETRY_DELAY: &str = "retryDelay";
    pub const CONSUME_TIMEOUT: &str = "consumeTimeout";
    pub const PRIORITY: &str = "priority";
}

/// Highest accepted priority value (lowest urgency)
pub const MAX_PRIORITY: u8 = 7;

/// Default number of failed deliveries before dead-lettering
pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Default delay before a failed message is retried (ms)
pub const DEFAULT_RETRY_DELAY: u64 = 60_000;

/// Unique message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Where a message is delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDestination {
    /// Target queue
    pub queue: QueueParams,
    /// Consumer group of a PUB_SUB queue. `None` fans out to every group.
    pub consumer_group: Option<String>,
}

/// The immutable part of a message, as built by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducibleMessage {
    /// Opaque payload
    pub body: serde_json::Value,
    /// Time to live in ms (0 = never expires)
    pub ttl: u64,
    /// Failed deliveries allowed before dead-lettering
    pub retry_threshold: u32,
    /// Delay before a failed message is retried, in ms (0 = immediately)
    pub retry_delay: u64,
    /// Maximum handler run time in ms (0 = unbounded)
    pub consume_timeout: u64,
    /// Priority for PRIORITY queues, 0 is the most urgent
    pub priority: Option<u8>,
    /// Optional delivery schedule
    pub schedule: Option<MessageSchedule>,
    /// Target queue and consumer group
    pub destination: Option<MessageDestination>,
}

impl ProducibleMessage {
    /// Create a message with default settings around a payload
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            ttl: 0,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            retry_delay: DEFAULT_RETRY_DELAY,
            consume_timeout: 0,
            priority: None,
            schedule: None,
            destination: None,
        }
    }

    /// Set the destination queue
    pub fn set_queue(mut self, queue: QueueParams) -> Self {
        let consumer_group = self.destination.take().and_then(|d| d.consumer_group);
        self.destination = Some(MessageDestination {
            queue,
            consumer_group,
        });
        self
    }

    /// Restrict delivery to one consumer group of a PUB_SUB queue
    pub fn set_consumer_group(mut self, group: impl Into<String>) -> Self {
        if let Some(destination) = self.destination.as_mut() {
            destination.consumer_group = Some(group.into());
        }
        self
    }

    /// Set the time to live (ms)
    pub fn set_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the retry threshold
    pub fn set_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = threshold;
        self
    }

    /// Set the retry delay (ms)
    pub fn set_retry_delay(mut self, delay: u64) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the consume timeout (ms)
    pub fn set_consume_timeout(mut self, timeout: u64) -> Self {
        self.consume_timeout = timeout;
        self
    }

    /// Set the priority (0..=7)
    pub fn set_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Deliver on a cron schedule
    pub fn set_schedule_cron(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(MessageSchedule::Cron(expr.into()));
        self
    }

    /// Deliver once after a delay (ms)
    pub fn set_schedule_delay(mut self, delay: u64) -> Self {
        self.schedule = Some(MessageSchedule::Delay(delay));
        self
    }

    /// Deliver `count` times, `period` ms apart
    pub fn set_schedule_repeat(mut self, period: u64, count: u32) -> Self {
        self.schedule = Some(MessageSchedule::Repeat { period, count });
        self
    }

    /// Check the message can be published
    pub fn validate(&self) -> SmithyResult<()> {
        let destination = self
            .destination
            .as_ref()
            .ok_or_else(|| SmithyError::invalid_message("destination queue is required"))?;
        if let Some(group) = &destination.consumer_group {
            validate_name("consumer group", group)?;
        }
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(SmithyError::invalid_message(format!(
                    "priority must be between 0 and {}",
                    MAX_PRIORITY
                )));
            }
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}

/// A persisted message: producible settings, status and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Message id
    pub id: MessageId,
    /// Current status
    pub status: MessageStatus,
    /// Resolved destination; fanned-out copies carry their own group
    pub destination: MessageDestination,
    /// Producible settings
    pub message: ProducibleMessage,
    /// Lifecycle tracking
    pub state: MessageState,
}

impl MessageEnvelope {
    /// Wrap a producible message for one destination
    pub fn new(id: MessageId, message: ProducibleMessage, destination: MessageDestination) -> Self {
        Self {
            id,
            status: MessageStatus::New,
            destination,
            message,
            state: MessageState::default(),
        }
    }

    /// Queue the message belongs to
    pub fn queue(&self) -> &QueueParams {
        &self.destination.queue
    }

    /// Consumer group the message belongs to
    pub fn consumer_group(&self) -> Option<&str> {
        self.destination.consumer_group.as_deref()
    }

    /// Whether the TTL elapsed since publication
    pub fn has_expired(&self, now: u64) -> bool {
        if self.message.ttl == 0 {
            return false;
        }
        let published = self.state.published_at.unwrap_or(now);
        now.saturating_sub(published) > self.message.ttl
    }

    /// Flat hash fields as written on publication
    pub fn to_hash_fields(&self) -> SmithyResult<Vec<(String, String)>> {
        let mut out = vec![
            (fields::ID.to_string(), self.id.to_string()),
            (fields::STATUS.to_string(), self.status.code().to_string()),
            (
                fields::MESSAGE.to_string(),
                serde_json::to_string(&self.message)?,
            ),
            (fields::QUEUE.to_string(), self.destination.queue.to_string()),
            (
                fields::CONSUMER_GROUP_ID.to_string(),
                self.destination.consumer_group.clone().unwrap_or_default(),
            ),
            (fields::TTL.to_string(), self.message.ttl.to_string()),
            (
                fields::RETRY_THRESHOLD.to_string(),
                self.message.retry_threshold.to_string(),
            ),
            (
                fields::RETRY_DELAY.to_string(),
                self.message.retry_delay.to_string(),
            ),
            (
                fields::CONSUME_TIMEOUT.to_string(),
                self.message.consume_timeout.to_string(),
            ),
            (
                fields::PRIORITY.to_string(),
                self.message
                    .priority
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            ),
        ];
        out.extend(
            self.state
                .to_hash_fields()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );
        Ok(out)
    }

    /// Decode a message hash; `None` when the hash is empty
    pub fn from_hash(hash: &HashMap<String, String>) -> SmithyResult<Option<Self>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| -> SmithyResult<&String> {
            hash.get(name)
                .ok_or_else(|| SmithyError::invalid_message(format!("missing field '{}'", name)))
        };

        let id = MessageId::from(field(fields::ID)?.as_str());
        let status = MessageStatus::parse_code(field(fields::STATUS)?)?;
        let message: ProducibleMessage = serde_json::from_str(field(fields::MESSAGE)?)?;
        let queue: QueueParams = field(fields::QUEUE)?.parse()?;
        let consumer_group = hash
            .get(fields::CONSUMER_GROUP_ID)
            .filter(|g| !g.is_empty())
            .cloned();

        Ok(Some(Self {
            id,
            status,
            destination: MessageDestination {
                queue,
                consumer_group,
            },
            message,
            state: MessageState::from_hash(hash),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> QueueParams {
        QueueParams::new("orders", "shop").unwrap()
    }

    fn to_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_builder_defaults() {
        let msg = ProducibleMessage::new(json!("hello"));
        assert_eq!(msg.retry_threshold, DEFAULT_RETRY_THRESHOLD);
        assert_eq!(msg.retry_delay, DEFAULT_RETRY_DELAY);
        assert!(msg.priority.is_none());
        // no destination yet
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_consumer_group_survives_queue_change() {
        let msg = ProducibleMessage::new(json!(1))
            .set_queue(orders())
            .set_consumer_group("billing")
            .set_queue(QueueParams::new("invoices", "shop").unwrap());
        let destination = msg.destination.unwrap();
        assert_eq!(destination.queue.name, "invoices");
        assert_eq!(destination.consumer_group.as_deref(), Some("billing"));
    }

    #[test]
    fn test_validation_rejects_bad_priority_and_schedule() {
        let msg = ProducibleMessage::new(json!(1)).set_queue(orders()).set_priority(8);
        assert!(matches!(msg.validate(), Err(SmithyError::InvalidMessage { .. })));

        let msg = ProducibleMessage::new(json!(1))
            .set_queue(orders())
            .set_schedule_cron("nope");
        assert!(msg.validate().is_err());

        let msg = ProducibleMessage::new(json!(1))
            .set_queue(orders())
            .set_priority(7)
            .set_schedule_repeat(1_000, 2);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_envelope_hash_encoding() {
        let msg = ProducibleMessage::new(json!({"a": 1}))
            .set_queue(orders())
            .set_ttl(5_000)
            .set_priority(2);
        let destination = msg.destination.clone().unwrap();
        let mut envelope = MessageEnvelope::new(MessageId::from("m1"), msg, destination);
        envelope.status = MessageStatus::Pending;
        envelope.state.published_at = Some(1_000);

        let hash = to_map(envelope.to_hash_fields().unwrap());
        assert_eq!(hash[fields::STATUS], "1");
        assert_eq!(hash[fields::QUEUE], "orders@shop");
        assert_eq!(hash[fields::PRIORITY], "2");
        assert_eq!(hash[fields::CONSUMER_GROUP_ID], "");
        assert_eq!(hash[state::fields::ATTEMPTS], "0");

        let decoded = MessageEnvelope::from_hash(&hash).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(MessageEnvelope::from_hash(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let msg = ProducibleMessage::new(json!(1)).set_queue(orders()).set_ttl(100);
        let destination = msg.destination.clone().unwrap();
        let mut envelope = MessageEnvelope::new(MessageId::generate(), msg, destination);
        envelope.state.published_at = Some(1_000);
        assert!(!envelope.has_expired(1_100));
        assert!(envelope.has_expired(1_101));

        envelope.message.ttl = 0;
        assert!(!envelope.has_expired(u64::MAX));
    }
}
