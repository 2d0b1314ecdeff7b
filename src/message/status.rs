//! Message status codes and unacknowledgement reasons.

use crate::error::{SmithyError, SmithyResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a message. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Built but not yet published
    New,
    /// Waiting in a pending structure
    Pending,
    /// Held by a consumer
    Processing,
    /// Consumed successfully (terminal)
    Acknowledged,
    /// Failed, waiting for its retry delay
    UnackDelaying,
    /// Failed, waiting to be requeued immediately
    UnackRequeuing,
    /// Retries exhausted, expired or rejected (terminal)
    DeadLettered,
    /// Waiting for a scheduled time
    Scheduled,
}

impl MessageStatus {
    /// Numeric code stored in the message hash and passed to scripts
    pub fn code(self) -> u8 {
        match self {
            MessageStatus::New => 0,
            MessageStatus::Pending => 1,
            MessageStatus::Processing => 2,
            MessageStatus::Acknowledged => 3,
            MessageStatus::UnackDelaying => 4,
            MessageStatus::UnackRequeuing => 5,
            MessageStatus::DeadLettered => 6,
            MessageStatus::Scheduled => 7,
        }
    }

    /// Parse a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageStatus::New,
            1 => MessageStatus::Pending,
            2 => MessageStatus::Processing,
            3 => MessageStatus::Acknowledged,
            4 => MessageStatus::UnackDelaying,
            5 => MessageStatus::UnackRequeuing,
            6 => MessageStatus::DeadLettered,
            7 => MessageStatus::Scheduled,
            _ => return None,
        })
    }

    /// Parse the string form of a numeric code
    pub fn parse_code(raw: &str) -> SmithyResult<Self> {
        raw.parse::<u8>()
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(|| SmithyError::invalid_message(format!("unknown status code '{}'", raw)))
    }

    /// Terminal statuses are kept only for audit
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Acknowledged | MessageStatus::DeadLettered)
    }

    /// Only terminal messages can be requeued manually
    pub fn is_requeuable(self) -> bool {
        self.is_terminal()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Manual requeue forks a new message and leaves the original untouched,
    /// so it is not an edge of this graph.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (New, Pending)
                | (New, Scheduled)
                | (Scheduled, Pending)
                | (Scheduled, Scheduled)
                | (Pending, Processing)
                | (Processing, Acknowledged)
                | (Processing, UnackDelaying)
                | (Processing, UnackRequeuing)
                | (Processing, DeadLettered)
                | (UnackDelaying, Scheduled)
                | (UnackRequeuing, Pending)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageStatus::New => "NEW",
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Acknowledged => "ACKNOWLEDGED",
            MessageStatus::UnackDelaying => "UNACK_DELAYING",
            MessageStatus::UnackRequeuing => "UNACK_REQUEUING",
            MessageStatus::DeadLettered => "DEAD_LETTERED",
            MessageStatus::Scheduled => "SCHEDULED",
        };
        f.write_str(name)
    }
}

/// Why a consumer gave a message back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnacknowledgeReason {
    /// The consumer holding the message stopped sending heartbeats
    OfflineConsumer,
    /// The message handler returned an error
    ConsumeError,
    /// The message handler ran past the consume timeout
    Timeout,
    /// The message TTL elapsed before it was consumed
    TtlExpired,
    /// The handler rejected the message, no retry
    Rejected,
    /// The consumer shut down while holding the message
    Shutdown,
}

impl UnacknowledgeReason {
    /// Numeric code passed to scripts
    pub fn code(self) -> u8 {
        match self {
            UnacknowledgeReason::OfflineConsumer => 0,
            UnacknowledgeReason::ConsumeError => 1,
            UnacknowledgeReason::Timeout => 2,
            UnacknowledgeReason::TtlExpired => 3,
            UnacknowledgeReason::Rejected => 4,
            UnacknowledgeReason::Shutdown => 5,
        }
    }

    /// Reasons that dead-letter regardless of the remaining retries
    pub fn skips_retry(self) -> bool {
        matches!(
            self,
            UnacknowledgeReason::TtlExpired | UnacknowledgeReason::Rejected
        )
    }
}

/// Where an unacknowledged message went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnacknowledgeOutcome {
    /// The message was not in processing anymore (nothing done)
    NotInProcessing,
    /// Retry after the message's retry delay
    Delayed,
    /// Retry immediately
    Requeued,
    /// No retry left
    DeadLettered,
}

impl UnacknowledgeOutcome {
    /// Parse the code returned by the UNACKNOWLEDGE_MESSAGE script
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => UnacknowledgeOutcome::NotInProcessing,
            1 => UnacknowledgeOutcome::Delayed,
            2 => UnacknowledgeOutcome::Requeued,
            3 => UnacknowledgeOutcome::DeadLettered,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        for code in 0..8u8 {
            let status = MessageStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(MessageStatus::from_code(8).is_none());
        assert_eq!(MessageStatus::parse_code("6").unwrap(), MessageStatus::DeadLettered);
        assert!(MessageStatus::parse_code("x").is_err());
    }

    #[test]
    fn test_lifecycle_edges() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(DeadLettered));
        assert!(UnackDelaying.can_transition_to(Scheduled));
        assert!(UnackRequeuing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Acknowledged));
        assert!(!Acknowledged.can_transition_to(Pending));
        assert!(!DeadLettered.can_transition_to(Processing));
    }

    #[test]
    fn test_requeuable_statuses() {
        assert!(MessageStatus::Acknowledged.is_requeuable());
        assert!(MessageStatus::DeadLettered.is_requeuable());
        assert!(!MessageStatus::Processing.is_requeuable());
        assert!(!MessageStatus::Pending.is_requeuable());
    }

    #[test]
    fn test_reasons() {
        assert!(UnacknowledgeReason::TtlExpired.skips_retry());
        assert!(UnacknowledgeReason::Rejected.skips_retry());
        assert!(!UnacknowledgeReason::OfflineConsumer.skips_retry());
        assert_eq!(UnacknowledgeOutcome::from_code(3), Some(UnacknowledgeOutcome::DeadLettered));
        assert_eq!(UnacknowledgeOutcome::from_code(7), None);
    }
}
