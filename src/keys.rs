//! Redis key schema.
//!
//! Every key lives under a fixed prefix (`RedisConfig::key_prefix`) followed by
//! the logical scope it belongs to:
//!
//! - main keys: `smithymq:global:*`
//! - namespace keys: `smithymq:ns:<ns>:*`
//! - queue keys: `smithymq:queue:<ns>:<name>:*`
//! - message keys: `smithymq:msg:<id>`
//! - consumer keys: `smithymq:consumer:<id>:*`
//!
//! Nothing else in the crate formats key names by hand.

use crate::queue::QueueParams;

/// Key schema rooted at a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a key schema with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix every key starts with
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of all queues (`name@ns`)
    pub fn queues(&self) -> String {
        format!("{}:global:queues", self.prefix)
    }

    /// Set of all namespaces
    pub fn namespaces(&self) -> String {
        format!("{}:global:namespaces", self.prefix)
    }

    /// Sorted set of consumer ids scored by their last heartbeat
    pub fn heartbeats(&self) -> String {
        format!("{}:global:heartbeats", self.prefix)
    }

    /// Set of queues (`name@ns`) of a namespace
    pub fn namespace_queues(&self, ns: &str) -> String {
        format!("{}:ns:{}:queues", self.prefix, ns)
    }

    /// Set of queues bound to a fanout exchange
    pub fn fanout_exchange_queues(&self, ns: &str, exchange: &str) -> String {
        format!("{}:ns:{}:exchange:fanout:{}:queues", self.prefix, ns, exchange)
    }

    /// Keys of a queue
    pub fn queue(&self, queue: &QueueParams) -> QueueKeys {
        QueueKeys {
            base: format!("{}:queue:{}:{}", self.prefix, queue.ns, queue.name),
        }
    }

    /// Message hash
    pub fn message(&self, message_id: &str) -> String {
        format!("{}{}", self.message_prefix(), message_id)
    }

    /// Prefix of message hashes, used by scripts that discover ids at runtime
    pub fn message_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    /// Heartbeat key of a consumer (string with TTL)
    pub fn consumer_heartbeat(&self, consumer_id: &str) -> String {
        format!("{}{}:heartbeat", self.consumer_prefix(), consumer_id)
    }

    /// Prefix of consumer keys
    pub fn consumer_prefix(&self) -> String {
        format!("{}:consumer:", self.prefix)
    }

    /// Set of queues (`name@ns`) a consumer is subscribed to
    pub fn consumer_queues(&self, consumer_id: &str) -> String {
        format!("{}{}:queues", self.consumer_prefix(), consumer_id)
    }

    /// Purge job record
    pub fn purge_job(&self, job_id: &str) -> String {
        format!("{}:job:purge:{}", self.prefix, job_id)
    }
}

/// Keys scoped to one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    /// Properties hash (settings, counters, operational state)
    pub fn properties(&self) -> String {
        format!("{}:properties", self.base)
    }

    /// Pending list (FIFO/LIFO), per consumer group for PUB_SUB queues
    pub fn pending(&self, consumer_group: Option<&str>) -> String {
        match consumer_group {
            Some(group) => format!("{}:cg:{}:pending", self.base, group),
            None => format!("{}:pending", self.base),
        }
    }

    /// Pending sorted set of PRIORITY queues, per consumer group for PUB_SUB queues
    pub fn priority_pending(&self, consumer_group: Option<&str>) -> String {
        match consumer_group {
            Some(group) => format!("{}:cg:{}:pending:priority", self.base, group),
            None => format!("{}:pending:priority", self.base),
        }
    }

    /// Scheduled sorted set (score = due timestamp)
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.base)
    }

    /// Messages waiting for their retry delay
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    /// Messages waiting to be requeued immediately
    pub fn requeued(&self) -> String {
        format!("{}:requeued", self.base)
    }

    /// Acknowledged audit sorted set (score = acknowledgement time)
    pub fn acknowledged(&self) -> String {
        format!("{}:acknowledged", self.base)
    }

    /// Dead-letter audit sorted set (score = dead-letter time)
    pub fn dead_lettered(&self) -> String {
        format!("{}:dead-lettered", self.base)
    }

    /// Set of all message ids of the queue
    pub fn messages(&self) -> String {
        format!("{}:messages", self.base)
    }

    /// Hash of consumer id -> consumer info
    pub fn consumers(&self) -> String {
        format!("{}:consumers", self.base)
    }

    /// Set of consumer group ids
    pub fn consumer_groups(&self) -> String {
        format!("{}:consumer-groups", self.base)
    }

    /// Hash of processing list key -> consumer id
    pub fn processing_queues(&self) -> String {
        format!("{}:processing-queues", self.base)
    }

    /// Processing marker of one consumer
    pub fn processing(&self, consumer_id: &str) -> String {
        format!("{}:processing:{}", self.base, consumer_id)
    }

    /// Fixed-window rate limit counter
    pub fn rate_limit_counter(&self) -> String {
        format!("{}:rate-limit", self.base)
    }

    /// Capped list of operational state transitions (newest first)
    pub fn state_history(&self) -> String {
        format!("{}:state-history", self.base)
    }
}
