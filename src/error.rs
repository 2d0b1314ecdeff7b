//! Error types for SmithyMQ operations.
//!
//! Errors fall into a few families: not-found errors (always recoverable by
//! the caller), precondition errors (surfaced immediately), concurrency errors
//! (retried by the WATCH helper before surfacing), protocol errors (an
//! unexpected script reply is a defect, never coerced) and fatal worker
//! errors.

use thiserror::Error;

/// Result type used throughout SmithyMQ.
pub type SmithyResult<T> = Result<T, SmithyError>;

/// Main error type for SmithyMQ operations.
#[derive(Error, Debug)]
pub enum SmithyError {
    /// Queue does not exist
    #[error("Queue '{queue}' not found")]
    QueueNotFound {
        /// Queue identity (`name@namespace`)
        queue: String,
    },

    /// Queue already exists
    #[error("Queue '{queue}' already exists")]
    QueueAlreadyExists {
        /// Queue identity
        queue: String,
    },

    /// Queue still holds messages
    #[error("Queue '{queue}' is not empty")]
    QueueNotEmpty {
        /// Queue identity
        queue: String,
    },

    /// Queue has at least one online consumer
    #[error("Queue '{queue}' has active consumers")]
    QueueHasActiveConsumers {
        /// Queue identity
        queue: String,
    },

    /// Queue is bound to an exchange
    #[error("Queue '{queue}' is bound to an exchange")]
    QueueHasBoundExchange {
        /// Queue identity
        queue: String,
    },

    /// PUB_SUB queue without any consumer group
    #[error("Queue '{queue}' has no consumer groups")]
    QueueHasNoConsumerGroups {
        /// Queue identity
        queue: String,
    },

    /// Queue parameters are malformed
    #[error("Invalid queue parameters: {message}")]
    InvalidQueueParams {
        /// Error message
        message: String,
    },

    /// Message does not exist
    #[error("Message '{message_id}' not found")]
    MessageNotFound {
        /// Message id
        message_id: String,
    },

    /// Message is not held by any consumer
    #[error("Message '{message_id}' is not in processing")]
    MessageNotInProcessing {
        /// Message id
        message_id: String,
    },

    /// Manual requeue is only possible from a terminal status
    #[error("Message '{message_id}' can not be requeued from its current status")]
    MessageNotRequeuable {
        /// Message id
        message_id: String,
    },

    /// Message belongs to another queue than the one given
    #[error("Message '{message_id}' does not belong to queue '{queue}'")]
    MessageQueueMismatch {
        /// Message id
        message_id: String,
        /// Queue identity given by the caller
        queue: String,
    },

    /// Message failed validation before publishing
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// Error message
        message: String,
    },

    /// Consumer group does not exist
    #[error("Consumer group '{group}' not found")]
    ConsumerGroupNotFound {
        /// Consumer group id
        group: String,
    },

    /// Consumer group still has pending messages
    #[error("Consumer group '{group}' is not empty")]
    ConsumerGroupNotEmpty {
        /// Consumer group id
        group: String,
    },

    /// PUB_SUB queues require a consumer group
    #[error("A consumer group is required for PUB_SUB queue '{queue}'")]
    ConsumerGroupRequired {
        /// Queue identity
        queue: String,
    },

    /// POINT_TO_POINT queues have no consumer groups
    #[error("Consumer groups are not supported by POINT_TO_POINT queue '{queue}'")]
    ConsumerGroupsNotSupported {
        /// Queue identity
        queue: String,
    },

    /// Requested queue state edge is not allowed or the state moved
    #[error("Invalid state transition: {message}")]
    InvalidStateTransition {
        /// Error message
        message: String,
    },

    /// Unlock attempted with the wrong lock id or owner
    #[error("Invalid lock for queue '{queue}'")]
    InvalidLock {
        /// Queue identity
        queue: String,
    },

    /// Rate limit parameters are out of range
    #[error("Invalid rate limit: {message}")]
    InvalidRateLimit {
        /// Error message
        message: String,
    },

    /// Fanout exchange binding conflicts
    #[error("Exchange binding error: {message}")]
    ExchangeBinding {
        /// Error message
        message: String,
    },

    /// The WATCH/MULTI/EXEC helper gave up after repeated conflicts
    #[error("Transaction aborted after {attempts} attempts (watched keys kept changing)")]
    WatchRetriesExceeded {
        /// Number of attempts performed
        attempts: u32,
    },

    /// A script replied with something we don't know how to read
    #[error("Unexpected reply from script {script}: {reply}")]
    UnexpectedScriptReply {
        /// Script name
        script: String,
        /// Debug rendering of the reply
        reply: String,
    },

    /// A background worker tick failed
    #[error("Worker '{worker}' crashed: {message}")]
    WorkerCrashed {
        /// Worker name
        worker: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Component is already running
    #[error("Already running")]
    AlreadyRunning,

    /// Component is not running
    #[error("Not running")]
    NotRunning,

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl SmithyError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create an unexpected reply error
    pub fn unexpected_reply(script: impl Into<String>, reply: impl std::fmt::Debug) -> Self {
        Self::UnexpectedScriptReply {
            script: script.into(),
            reply: format!("{:?}", reply),
        }
    }

    /// Map a symbolic error string returned by a Lua script to a typed error.
    ///
    /// `subject` is the entity the script operated on (queue identity,
    /// message id or consumer group), used to fill the error fields.
    /// Returns `None` when `code` is not a known error code.
    pub fn from_script_code(code: &str, subject: &str) -> Option<Self> {
        let subject = subject.to_string();
        let err = match code {
            "QUEUE_NOT_FOUND" => Self::QueueNotFound { queue: subject },
            "QUEUE_EXISTS" => Self::QueueAlreadyExists { queue: subject },
            "QUEUE_NOT_EMPTY" => Self::QueueNotEmpty { queue: subject },
            "QUEUE_HAS_ACTIVE_CONSUMERS" => Self::QueueHasActiveConsumers { queue: subject },
            "QUEUE_HAS_BOUND_EXCHANGE" => Self::QueueHasBoundExchange { queue: subject },
            "QUEUE_HAS_NO_CONSUMER_GROUPS" => Self::QueueHasNoConsumerGroups { queue: subject },
            "QUEUE_TYPE_MISMATCH" => Self::InvalidQueueParams {
                message: format!("queue '{}' changed its type", subject),
            },
            "MESSAGE_NOT_FOUND" => Self::MessageNotFound {
                message_id: subject,
            },
            "MESSAGE_NOT_IN_PROCESSING" => Self::MessageNotInProcessing {
                message_id: subject,
            },
            "MESSAGE_NOT_REQUEUABLE" => Self::MessageNotRequeuable {
                message_id: subject,
            },
            "CONSUMER_GROUP_NOT_FOUND" => Self::ConsumerGroupNotFound { group: subject },
            "CONSUMER_GROUP_NOT_EMPTY" => Self::ConsumerGroupNotEmpty { group: subject },
            "CONSUMER_GROUP_REQUIRED" => Self::ConsumerGroupRequired { queue: subject },
            "CONSUMER_GROUPS_NOT_SUPPORTED" => Self::ConsumerGroupsNotSupported { queue: subject },
            "INVALID_STATE_TRANSITION" => Self::InvalidStateTransition {
                message: format!("state of queue '{}' changed concurrently", subject),
            },
            "INVALID_LOCK" => Self::InvalidLock { queue: subject },
            _ => return None,
        };
        Some(err)
    }

    /// Whether this error means "the thing does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::QueueNotFound { .. }
                | Self::MessageNotFound { .. }
                | Self::ConsumerGroupNotFound { .. }
        )
    }
}
