//! Mutable tracking block of a message: timestamps, counters, flags and
//! provenance links. Scripts update these fields in place in the message hash.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field names of the state part of the message hash.
pub mod fields {
    pub const PUBLISHED_AT: &str = "publishedAt";
    pub const SCHEDULED_AT: &str = "scheduledAt";
    pub const LAST_SCHEDULED_AT: &str = "lastScheduledAt";
    pub const PROCESSING_STARTED_AT: &str = "processingStartedAt";
    pub const ACKNOWLEDGED_AT: &str = "acknowledgedAt";
    pub const UNACKNOWLEDGED_AT: &str = "unacknowledgedAt";
    pub const LAST_UNACKNOWLEDGED_AT: &str = "lastUnacknowledgedAt";
    pub const DEAD_LETTERED_AT: &str = "deadLetteredAt";
    pub const REQUEUED_AT: &str = "requeuedAt";
    pub const LAST_REQUEUED_AT: &str = "lastRequeuedAt";
    pub const LAST_RETRIED_ATTEMPT_AT: &str = "lastRetriedAttemptAt";
    pub const ATTEMPTS: &str = "attempts";
    pub const REQUEUE_COUNT: &str = "requeueCount";
    pub const SCHEDULED_REPEAT_COUNT: &str = "scheduledRepeatCount";
    pub const SCHEDULED_TIMES: &str = "scheduledTimes";
    pub const EXPIRED: &str = "expired";
    pub const SCHEDULED_CRON_FIRED: &str = "scheduledCronFired";
    pub const SCHEDULED_MESSAGE_PARENT_ID: &str = "scheduledMessageParentId";
    pub const REQUEUED_MESSAGE_PARENT_ID: &str = "requeuedMessageParentId";
    pub const LAST_CONSUMER_ID: &str = "lastConsumerId";
}

/// Lifecycle tracking of one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageState {
    pub published_at: Option<u64>,
    pub scheduled_at: Option<u64>,
    pub last_scheduled_at: Option<u64>,
    pub processing_started_at: Option<u64>,
    pub acknowledged_at: Option<u64>,
    pub unacknowledged_at: Option<u64>,
    pub last_unacknowledged_at: Option<u64>,
    pub dead_lettered_at: Option<u64>,
    pub requeued_at: Option<u64>,
    pub last_requeued_at: Option<u64>,
    pub last_retried_attempt_at: Option<u64>,
    /// Deliveries that ended in an unacknowledgement
    pub attempts: u32,
    /// Manual requeues forked from this message
    pub requeue_count: u32,
    pub scheduled_repeat_count: u32,
    /// Times a scheduled template fired
    pub scheduled_times: u64,
    pub expired: bool,
    pub scheduled_cron_fired: bool,
    /// Template this message was forked from by the scheduler
    pub scheduled_message_parent_id: Option<String>,
    /// Message this one was forked from by a manual requeue
    pub requeued_message_parent_id: Option<String>,
    /// Consumer that last checked the message out
    pub last_consumer_id: Option<String>,
}

impl MessageState {
    /// Hash fields for a freshly published message.
    ///
    /// Counters are always written so scripts can `HINCRBY` them; absent
    /// timestamps and links are written as empty strings.
    pub fn to_hash_fields(&self) -> Vec<(&'static str, String)> {
        let ts = |v: Option<u64>| v.map(|t| t.to_string()).unwrap_or_default();
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        vec![
            (fields::PUBLISHED_AT, ts(self.published_at)),
            (fields::SCHEDULED_AT, ts(self.scheduled_at)),
            (fields::LAST_SCHEDULED_AT, ts(self.last_scheduled_at)),
            (fields::PROCESSING_STARTED_AT, ts(self.processing_started_at)),
            (fields::ACKNOWLEDGED_AT, ts(self.acknowledged_at)),
            (fields::UNACKNOWLEDGED_AT, ts(self.unacknowledged_at)),
            (fields::LAST_UNACKNOWLEDGED_AT, ts(self.last_unacknowledged_at)),
            (fields::DEAD_LETTERED_AT, ts(self.dead_lettered_at)),
            (fields::REQUEUED_AT, ts(self.requeued_at)),
            (fields::LAST_REQUEUED_AT, ts(self.last_requeued_at)),
            (fields::LAST_RETRIED_ATTEMPT_AT, ts(self.last_retried_attempt_at)),
            (fields::ATTEMPTS, self.attempts.to_string()),
            (fields::REQUEUE_COUNT, self.requeue_count.to_string()),
            (fields::SCHEDULED_REPEAT_COUNT, self.scheduled_repeat_count.to_string()),
            (fields::SCHEDULED_TIMES, self.scheduled_times.to_string()),
            (fields::EXPIRED, flag(self.expired)),
            (fields::SCHEDULED_CRON_FIRED, flag(self.scheduled_cron_fired)),
            (
                fields::SCHEDULED_MESSAGE_PARENT_ID,
                self.scheduled_message_parent_id.clone().unwrap_or_default(),
            ),
            (
                fields::REQUEUED_MESSAGE_PARENT_ID,
                self.requeued_message_parent_id.clone().unwrap_or_default(),
            ),
            (
                fields::LAST_CONSUMER_ID,
                self.last_consumer_id.clone().unwrap_or_default(),
            ),
        ]
    }

    /// Read the state fields back from a message hash
    pub fn from_hash(hash: &HashMap<String, String>) -> Self {
        let ts = |field: &str| -> Option<u64> {
            hash.get(field)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        let count = |field: &str| -> u64 {
            hash.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        let flag = |field: &str| hash.get(field).is_some_and(|v| v == "1");
        let link = |field: &str| hash.get(field).filter(|v| !v.is_empty()).cloned();

        Self {
            published_at: ts(fields::PUBLISHED_AT),
            scheduled_at: ts(fields::SCHEDULED_AT),
            last_scheduled_at: ts(fields::LAST_SCHEDULED_AT),
            processing_started_at: ts(fields::PROCESSING_STARTED_AT),
            acknowledged_at: ts(fields::ACKNOWLEDGED_AT),
            unacknowledged_at: ts(fields::UNACKNOWLEDGED_AT),
            last_unacknowledged_at: ts(fields::LAST_UNACKNOWLEDGED_AT),
            dead_lettered_at: ts(fields::DEAD_LETTERED_AT),
            requeued_at: ts(fields::REQUEUED_AT),
            last_requeued_at: ts(fields::LAST_REQUEUED_AT),
            last_retried_attempt_at: ts(fields::LAST_RETRIED_ATTEMPT_AT),
            attempts: count(fields::ATTEMPTS) as u32,
            requeue_count: count(fields::REQUEUE_COUNT) as u32,
            scheduled_repeat_count: count(fields::SCHEDULED_REPEAT_COUNT) as u32,
            scheduled_times: count(fields::SCHEDULED_TIMES),
            expired: flag(fields::EXPIRED),
            scheduled_cron_fired: flag(fields::SCHEDULED_CRON_FIRED),
            scheduled_message_parent_id: link(fields::SCHEDULED_MESSAGE_PARENT_ID),
            requeued_message_parent_id: link(fields::REQUEUED_MESSAGE_PARENT_ID),
            last_consumer_id: link(fields::LAST_CONSUMER_ID),
        }
    }
}
