//! Queues: identity, settings, counters and their managers.
//!
//! A queue is identified by `(namespace, name)` and rendered as `name@ns`.
//! Its settings, per-status counters and operational state live in a single
//! properties hash so scripts can read and update them in one place.
//!
//! # Examples
//!
//! ```rust
//! use smithymq::queue::{QueueParams, QueueType};
//!
//! let queue: QueueParams = "orders@shop".parse().unwrap();
//! assert_eq!(queue.name, "orders");
//! assert_eq!(queue.ns, "shop");
//! assert_eq!(QueueType::from_code(2), Some(QueueType::Priority));
//! ```

use crate::error::{SmithyError, SmithyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod manager;
pub mod purge;
pub mod state;

pub use manager::QueueManager;
pub use purge::{PurgeJob, PurgeJobStatus, QueuePurger};
pub use state::{
    QueueLockOwner, QueueOperationalState, QueueStateManager, QueueStateTransition,
    StateTransitionOptions, StateTransitionReason,
};

/// Field names of the queue properties hash. Lua scripts use the same names.
pub mod fields {
    pub const QUEUE_TYPE: &str = "queueType";
    pub const DELIVERY_MODEL: &str = "deliveryModel";
    pub const RATE_LIMIT: &str = "rateLimit";
    pub const EXCHANGE: &str = "exchange";
    pub const OPERATIONAL_STATE: &str = "operationalState";
    pub const LOCK_ID: &str = "lockId";
    pub const LOCK_OWNER: &str = "lockOwner";
    pub const LAST_STATE_CHANGE_AT: &str = "lastStateChangeAt";
    pub const STATE_TRANSITION: &str = "stateTransition";
    pub const CREATED_AT: &str = "createdAt";
    pub const MESSAGES_COUNT: &str = "messagesCount";
    pub const PENDING_COUNT: &str = "pendingMessagesCount";
    pub const PROCESSING_COUNT: &str = "processingMessagesCount";
    pub const SCHEDULED_COUNT: &str = "scheduledMessagesCount";
    pub const ACKNOWLEDGED_COUNT: &str = "acknowledgedMessagesCount";
    pub const DEAD_LETTERED_COUNT: &str = "deadLetteredMessagesCount";
    pub const DELAYED_COUNT: &str = "delayedMessagesCount";
    pub const REQUEUED_COUNT: &str = "requeuedMessagesCount";
}

const DEFAULT_NAMESPACE: &str = "default";

/// Validate a queue, namespace, consumer group or exchange name.
///
/// Names are lowercased; allowed characters are `a-z`, `0-9`, `-`, `_` and
/// `.`, and the name must start with a letter or digit.
pub fn validate_name(kind: &str, name: &str) -> SmithyResult<String> {
    let lowered = name.trim().to_lowercase();
    let valid = !lowered.is_empty()
        && lowered.len() <= 64
        && lowered
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && lowered
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(lowered)
    } else {
        Err(SmithyError::InvalidQueueParams {
            message: format!("invalid {} name '{}'", kind, name),
        })
    }
}

/// Identity of a queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueParams {
    /// Queue name
    pub name: String,
    /// Namespace
    pub ns: String,
}

impl QueueParams {
    /// Create validated queue params
    pub fn new(name: &str, ns: &str) -> SmithyResult<Self> {
        Ok(Self {
            name: validate_name("queue", name)?,
            ns: validate_name("namespace", ns)?,
        })
    }

    /// Queue in the given default namespace
    pub fn in_namespace(name: &str, default_ns: &str) -> SmithyResult<Self> {
        Self::new(name, default_ns)
    }
}

impl fmt::Display for QueueParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ns)
    }
}

impl FromStr for QueueParams {
    type Err = SmithyError;

    /// Parse `name@ns`, or a bare `name` in the `default` namespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, ns)) => Self::new(name, ns),
            None => Self::new(s, DEFAULT_NAMESPACE),
        }
    }
}

/// Ordering of a queue's pending structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    /// Last in, first out
    Lifo,
    /// First in, first out
    Fifo,
    /// Lowest priority value first
    Priority,
}

impl QueueType {
    /// Numeric code passed to scripts
    pub fn code(self) -> u8 {
        match self {
            QueueType::Lifo => 0,
            QueueType::Fifo => 1,
            QueueType::Priority => 2,
        }
    }

    /// Parse a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(QueueType::Lifo),
            1 => Some(QueueType::Fifo),
            2 => Some(QueueType::Priority),
            _ => None,
        }
    }

    /// Whether pending messages live in a sorted set
    pub fn is_priority(self) -> bool {
        matches!(self, QueueType::Priority)
    }
}

/// How messages are delivered to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryModel {
    /// Each message is consumed once
    PointToPoint,
    /// Each consumer group receives its own copy
    PubSub,
}

impl DeliveryModel {
    /// Numeric code passed to scripts
    pub fn code(self) -> u8 {
        match self {
            DeliveryModel::PointToPoint => 0,
            DeliveryModel::PubSub => 1,
        }
    }

    /// Parse a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeliveryModel::PointToPoint),
            1 => Some(DeliveryModel::PubSub),
            _ => None,
        }
    }
}

/// Per-queue consumption rate limit (fixed window)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRateLimit {
    /// Messages allowed per window
    pub limit: u64,
    /// Window length in milliseconds
    pub interval: u64,
}

impl QueueRateLimit {
    /// Smallest accepted window
    pub const MIN_INTERVAL_MS: u64 = 1000;

    /// Create a validated rate limit
    pub fn new(limit: u64, interval: u64) -> SmithyResult<Self> {
        let rate_limit = Self { limit, interval };
        rate_limit.validate()?;
        Ok(rate_limit)
    }

    /// Check the limit and window bounds
    pub fn validate(&self) -> SmithyResult<()> {
        if self.limit == 0 {
            return Err(SmithyError::InvalidRateLimit {
                message: "limit must be greater than 0".to_string(),
            });
        }
        if self.interval < Self::MIN_INTERVAL_MS {
            return Err(SmithyError::InvalidRateLimit {
                message: format!(
                    "interval must be at least {} ms",
                    Self::MIN_INTERVAL_MS
                ),
            });
        }
        Ok(())
    }
}

/// Per-status message counters of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessageCounts {
    /// Waiting to be consumed
    pub pending: u64,
    /// Held by a consumer
    pub processing: u64,
    /// Waiting for their scheduled time
    pub scheduled: u64,
    /// Kept for audit after acknowledgement
    pub acknowledged: u64,
    /// Kept for audit after dead-lettering
    pub dead_lettered: u64,
    /// Waiting for their retry delay
    pub delayed: u64,
    /// Waiting to be requeued immediately
    pub requeued: u64,
    /// All messages of the queue
    pub total: u64,
}

impl QueueMessageCounts {
    /// Sum of the per-status counters
    pub fn sum(&self) -> u64 {
        self.pending
            + self.processing
            + self.scheduled
            + self.acknowledged
            + self.dead_lettered
            + self.delayed
            + self.requeued
    }

    /// Whether the per-status counters add up to the total
    pub fn is_consistent(&self) -> bool {
        self.sum() == self.total
    }
}

/// Snapshot of a queue properties hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProperties {
    /// Ordering of pending messages
    pub queue_type: QueueType,
    /// Delivery model
    pub delivery_model: DeliveryModel,
    /// Optional rate limit
    pub rate_limit: Option<QueueRateLimit>,
    /// Bound fanout exchange
    pub exchange: Option<String>,
    /// Operational state
    pub operational_state: QueueOperationalState,
    /// Lock id while LOCKED
    pub lock_id: Option<String>,
    /// Lock owner while LOCKED
    pub lock_owner: Option<QueueLockOwner>,
    /// Per-status counters
    pub counts: QueueMessageCounts,
    /// Creation time (ms)
    pub created_at: u64,
}

impl QueueProperties {
    /// Decode the properties hash; `None` when the hash is empty (no queue)
    pub fn from_hash(hash: &HashMap<String, String>) -> SmithyResult<Option<Self>> {
        if hash.is_empty() {
            return Ok(None);
        }

        let number = |field: &str| -> u64 {
            hash.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        let non_empty = |field: &str| -> Option<String> {
            hash.get(field).filter(|v| !v.is_empty()).cloned()
        };

        let queue_type = hash
            .get(fields::QUEUE_TYPE)
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(QueueType::from_code)
            .ok_or_else(|| SmithyError::InvalidQueueParams {
                message: "corrupt queue type".to_string(),
            })?;
        let delivery_model = hash
            .get(fields::DELIVERY_MODEL)
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(DeliveryModel::from_code)
            .ok_or_else(|| SmithyError::InvalidQueueParams {
                message: "corrupt delivery model".to_string(),
            })?;
        let rate_limit = match non_empty(fields::RATE_LIMIT) {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        let operational_state = match hash.get(fields::OPERATIONAL_STATE) {
            Some(v) => v.parse()?,
            None => QueueOperationalState::Active,
        };
        let lock_owner = match non_empty(fields::LOCK_OWNER) {
            Some(v) => Some(v.parse()?),
            None => None,
        };

        Ok(Some(Self {
            queue_type,
            delivery_model,
            rate_limit,
            exchange: non_empty(fields::EXCHANGE),
            operational_state,
            lock_id: non_empty(fields::LOCK_ID),
            lock_owner,
            counts: QueueMessageCounts {
                pending: number(fields::PENDING_COUNT),
                processing: number(fields::PROCESSING_COUNT),
                scheduled: number(fields::SCHEDULED_COUNT),
                acknowledged: number(fields::ACKNOWLEDGED_COUNT),
                dead_lettered: number(fields::DEAD_LETTERED_COUNT),
                delayed: number(fields::DELAYED_COUNT),
                requeued: number(fields::REQUEUED_COUNT),
                total: number(fields::MESSAGES_COUNT),
            },
            created_at: number(fields::CREATED_AT),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_params_parsing() {
        let queue: QueueParams = "Orders@Shop".parse().unwrap();
        assert_eq!(queue.name, "orders");
        assert_eq!(queue.ns, "shop");
        assert_eq!(queue.to_string(), "orders@shop");

        let bare: QueueParams = "orders".parse().unwrap();
        assert_eq!(bare.ns, "default");

        assert!("bad name@shop".parse::<QueueParams>().is_err());
        assert!("@shop".parse::<QueueParams>().is_err());
        assert!("-orders@shop".parse::<QueueParams>().is_err());
    }

    #[test]
    fn test_codes() {
        for t in [QueueType::Lifo, QueueType::Fifo, QueueType::Priority] {
            assert_eq!(QueueType::from_code(t.code()), Some(t));
        }
        for m in [DeliveryModel::PointToPoint, DeliveryModel::PubSub] {
            assert_eq!(DeliveryModel::from_code(m.code()), Some(m));
        }
        assert_eq!(QueueType::from_code(9), None);
    }

    #[test]
    fn test_rate_limit_validation() {
        assert!(QueueRateLimit::new(3, 10_000).is_ok());
        assert!(matches!(
            QueueRateLimit::new(0, 10_000),
            Err(SmithyError::InvalidRateLimit { .. })
        ));
        assert!(QueueRateLimit::new(3, 999).is_err());
    }

    #[test]
    fn test_counts_consistency() {
        let mut counts = QueueMessageCounts {
            pending: 2,
            processing: 1,
            acknowledged: 3,
            total: 6,
            ..Default::default()
        };
        assert!(counts.is_consistent());
        counts.total = 7;
        assert!(!counts.is_consistent());
    }

    #[test]
    fn test_properties_from_hash() {
        assert!(QueueProperties::from_hash(&HashMap::new()).unwrap().is_none());

        let hash: HashMap<String, String> = [
            (fields::QUEUE_TYPE, "2"),
            (fields::DELIVERY_MODEL, "1"),
            (fields::RATE_LIMIT, r#"{"limit":3,"interval":10000}"#),
            (fields::OPERATIONAL_STATE, "LOCKED"),
            (fields::LOCK_ID, "job-1"),
            (fields::LOCK_OWNER, "PURGE_JOB"),
            (fields::MESSAGES_COUNT, "4"),
            (fields::PENDING_COUNT, "4"),
            (fields::EXCHANGE, ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let props = QueueProperties::from_hash(&hash).unwrap().unwrap();
        assert_eq!(props.queue_type, QueueType::Priority);
        assert_eq!(props.delivery_model, DeliveryModel::PubSub);
        assert_eq!(props.rate_limit, Some(QueueRateLimit { limit: 3, interval: 10_000 }));
        assert_eq!(props.operational_state, QueueOperationalState::Locked);
        assert_eq!(props.lock_owner, Some(QueueLockOwner::PurgeJob));
        assert_eq!(props.exchange, None);
        assert!(props.counts.is_consistent());
    }
}
