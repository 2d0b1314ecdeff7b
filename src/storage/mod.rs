//! Scripted storage operations.
//!
//! Every message status change goes through one of these calls, and each of
//! them is a single atomic script. The Rust side only resolves keys and
//! arguments up front and decodes the reply; the counters, the set
//! memberships and the status field are all updated server side together.

use crate::config::MessagesConfig;
use crate::error::{SmithyError, SmithyResult};
use crate::keys::QueueKeys;
use crate::message::{
    MessageEnvelope, MessageId, MessageSchedule, MessageStatus, UnacknowledgeOutcome,
    UnacknowledgeReason,
};
use crate::queue::{QueueParams, QueueType};
use crate::redis_client::scripts::{
    reply_int, reply_ints, reply_ok, reply_opt_string, reply_string, reply_strings,
};
use crate::redis_client::{RedisClient, ScriptCall, ScriptName};
use crate::utils::now_ms;

pub mod delete;

pub use delete::{DELETE_BATCH_SIZE, DeleteMessagesReply, DeleteMessagesStats, DeleteStatus};

/// One copy of a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Id of the copy
    pub id: MessageId,
    /// Consumer group receiving the copy
    pub consumer_group: Option<String>,
}

/// Result of an unacknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unacknowledged {
    pub outcome: UnacknowledgeOutcome,
    /// Failed attempts so far, including this one
    pub attempts: u64,
}

/// Handle on the storage scripts
#[derive(Debug, Clone)]
pub struct MessageStorage {
    redis: RedisClient,
    messages: MessagesConfig,
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn schedule_kind(schedule: Option<&MessageSchedule>) -> &'static str {
    match schedule {
        Some(MessageSchedule::Cron(_)) => "cron",
        Some(MessageSchedule::Repeat { .. }) => "repeat",
        Some(MessageSchedule::Delay(_)) => "delay",
        None => "",
    }
}

impl MessageStorage {
    /// Create a storage handle
    pub fn new(redis: RedisClient, messages: MessagesConfig) -> Self {
        Self { redis, messages }
    }

    /// Underlying client
    pub fn redis(&self) -> &RedisClient {
        &self.redis
    }

    fn keys(&self, queue: &QueueParams) -> QueueKeys {
        self.redis.keys().queue(queue)
    }

    fn prefix(&self) -> String {
        self.redis.keys().message_prefix()
    }

    /// Write `envelope` once per target, into pending or, when
    /// `scheduled_at` is set, into the scheduled set.
    ///
    /// Targets whose consumer group was deleted meanwhile are skipped, so
    /// the returned ids may be fewer than the targets.
    pub async fn publish(
        &self,
        envelope: &MessageEnvelope,
        queue_type: QueueType,
        targets: &[PublishTarget],
        scheduled_at: Option<u64>,
    ) -> SmithyResult<Vec<MessageId>> {
        let queue = envelope.queue();
        let keys = self.keys(queue);

        let mut call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(keys.messages())
            .key(keys.consumer_groups())
            .key(keys.scheduled());
        for target in targets {
            let group = target.consumer_group.as_deref();
            call = call
                .key(keys.pending(group))
                .key(keys.priority_pending(group));
        }

        call = call
            .arg(self.prefix())
            .arg(queue_type.code())
            .arg(scheduled_at.unwrap_or(0))
            .arg(now_ms())
            .arg(
                envelope
                    .message
                    .priority
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            )
            .arg(targets.len());
        for target in targets {
            call = call
                .arg(&target.id)
                .arg(target.consumer_group.as_deref().unwrap_or_default());
        }
        for (field, value) in envelope.to_hash_fields()? {
            call = call.arg(field).arg(value);
        }

        let reply = self.redis.run_script(ScriptName::Publish, call).await?;
        let ids = reply_strings(ScriptName::Publish, &reply)?;
        Ok(ids.into_iter().map(MessageId::from).collect())
    }

    /// Move the next pending message into the consumer's processing marker.
    ///
    /// `None` when nothing is pending.
    pub async fn checkout(
        &self,
        queue: &QueueParams,
        consumer_group: Option<&str>,
        consumer_id: &str,
    ) -> SmithyResult<Option<MessageId>> {
        let keys = self.keys(queue);
        let call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(keys.pending(consumer_group))
            .key(keys.priority_pending(consumer_group))
            .key(keys.processing(consumer_id))
            .arg(self.prefix())
            .arg(consumer_id)
            .arg(now_ms());

        let reply = self.redis.run_script(ScriptName::CheckoutMessage, call).await?;
        Ok(reply_opt_string(ScriptName::CheckoutMessage, &reply)?.map(MessageId::from))
    }

    /// Acknowledge a message held by `consumer_id`
    pub async fn acknowledge(
        &self,
        queue: &QueueParams,
        consumer_id: &str,
        message_id: &MessageId,
    ) -> SmithyResult<()> {
        let keys = self.keys(queue);
        let audit = &self.messages.acknowledged;
        let call = ScriptCall::new(queue.to_string())
            .target(message_id.as_str())
            .key(keys.properties())
            .key(keys.processing(consumer_id))
            .key(keys.acknowledged())
            .key(keys.messages())
            .arg(self.prefix())
            .arg(message_id)
            .arg(now_ms())
            .arg(flag(audit.store))
            .arg(audit.queue_size)
            .arg(audit.expire_ms);

        let reply = self
            .redis
            .run_script(ScriptName::AcknowledgeMessage, call)
            .await?;
        reply_ok(ScriptName::AcknowledgeMessage, &reply)
    }

    /// Give a message back: delayed retry, immediate retry or dead-letter.
    ///
    /// A message no longer in the consumer's processing marker is left alone
    /// and reported as `NotInProcessing`.
    pub async fn unacknowledge(
        &self,
        queue: &QueueParams,
        consumer_id: &str,
        message_id: &MessageId,
        reason: UnacknowledgeReason,
    ) -> SmithyResult<Unacknowledged> {
        let keys = self.keys(queue);
        let audit = &self.messages.dead_lettered;
        let call = ScriptCall::new(queue.to_string())
            .target(message_id.as_str())
            .key(keys.properties())
            .key(keys.processing(consumer_id))
            .key(keys.delayed())
            .key(keys.requeued())
            .key(keys.dead_lettered())
            .key(keys.messages())
            .arg(self.prefix())
            .arg(message_id)
            .arg(now_ms())
            .arg(reason.code())
            .arg(flag(reason.skips_retry()))
            .arg(flag(audit.store))
            .arg(audit.queue_size)
            .arg(audit.expire_ms);

        let reply = self
            .redis
            .run_script(ScriptName::UnacknowledgeMessage, call)
            .await?;
        match reply_ints(ScriptName::UnacknowledgeMessage, &reply)?.as_slice() {
            [code, attempts] => {
                let outcome = UnacknowledgeOutcome::from_code(*code).ok_or_else(|| {
                    SmithyError::unexpected_reply(ScriptName::UnacknowledgeMessage.as_str(), &reply)
                })?;
                Ok(Unacknowledged {
                    outcome,
                    attempts: (*attempts).max(0) as u64,
                })
            }
            _ => Err(SmithyError::unexpected_reply(
                ScriptName::UnacknowledgeMessage.as_str(),
                &reply,
            )),
        }
    }

    /// Fork a terminal message into a new pending message.
    ///
    /// The fork gets a fresh id and state and no schedule; the original
    /// stays where it is and records the requeue.
    pub async fn requeue_message(&self, original: &MessageEnvelope) -> SmithyResult<MessageId> {
        let queue = original.queue();
        let keys = self.keys(queue);
        let group = original.consumer_group();

        let mut message = original.message.clone();
        message.schedule = None;
        let mut fork =
            MessageEnvelope::new(MessageId::generate(), message, original.destination.clone());
        fork.status = MessageStatus::Pending;

        let mut call = ScriptCall::new(queue.to_string())
            .target(original.id.as_str())
            .key(keys.properties())
            .key(keys.messages())
            .key(keys.pending(group))
            .key(keys.priority_pending(group))
            .arg(self.prefix())
            .arg(&original.id)
            .arg(&fork.id)
            .arg(now_ms());
        for (field, value) in fork.to_hash_fields()? {
            call = call.arg(field).arg(value);
        }

        let reply = self.redis.run_script(ScriptName::RequeueMessage, call).await?;
        Ok(MessageId::from(reply_string(ScriptName::RequeueMessage, &reply)?))
    }

    /// Move an UNACK_REQUEUING message back into pending.
    ///
    /// `false` when the message was not waiting in the requeue list.
    pub async fn requeue_immediate(
        &self,
        queue: &QueueParams,
        message_id: &MessageId,
        consumer_group: Option<&str>,
    ) -> SmithyResult<bool> {
        let keys = self.keys(queue);
        let call = ScriptCall::new(queue.to_string())
            .target(message_id.as_str())
            .key(keys.properties())
            .key(keys.requeued())
            .key(keys.pending(consumer_group))
            .key(keys.priority_pending(consumer_group))
            .arg(self.prefix())
            .arg(message_id)
            .arg(now_ms());

        let reply = self
            .redis
            .run_script(ScriptName::RequeueImmediate, call)
            .await?;
        Ok(reply_int(ScriptName::RequeueImmediate, &reply)? == 1)
    }

    /// Move an UNACK_DELAYING message into the scheduled set, due after its
    /// retry delay.
    pub async fn requeue_delayed(
        &self,
        queue: &QueueParams,
        message_id: &MessageId,
    ) -> SmithyResult<bool> {
        let keys = self.keys(queue);
        let call = ScriptCall::new(queue.to_string())
            .target(message_id.as_str())
            .key(keys.properties())
            .key(keys.delayed())
            .key(keys.scheduled())
            .arg(self.prefix())
            .arg(message_id)
            .arg(now_ms());

        let reply = self.redis.run_script(ScriptName::RequeueDelayed, call).await?;
        Ok(reply_int(ScriptName::RequeueDelayed, &reply)? == 1)
    }

    /// Publish a due scheduled message.
    ///
    /// With `child`, the message is a template: the child is written into
    /// pending and the template moves to `next_timestamp`, or is removed
    /// when there is none. Without `child` the message itself goes to
    /// pending (a retried message keeps its id and history).
    pub async fn publish_scheduled(
        &self,
        message: &MessageEnvelope,
        child: Option<&MessageEnvelope>,
        next_timestamp: Option<u64>,
    ) -> SmithyResult<bool> {
        let queue = message.queue();
        let keys = self.keys(queue);
        let group = message.consumer_group();

        let mut call = ScriptCall::new(queue.to_string())
            .target(message.id.as_str())
            .key(keys.properties())
            .key(keys.scheduled())
            .key(keys.pending(group))
            .key(keys.priority_pending(group))
            .key(keys.messages())
            .arg(self.prefix())
            .arg(&message.id)
            .arg(now_ms())
            .arg(child.map(|c| c.id.to_string()).unwrap_or_default())
            .arg(next_timestamp.unwrap_or(0))
            .arg(schedule_kind(message.message.schedule.as_ref()));
        if let Some(child) = child {
            for (field, value) in child.to_hash_fields()? {
                call = call.arg(field).arg(value);
            }
        }

        let reply = self
            .redis
            .run_script(ScriptName::PublishScheduled, call)
            .await?;
        Ok(reply_int(ScriptName::PublishScheduled, &reply)? == 1)
    }

    /// Delete up to [`DELETE_BATCH_SIZE`] messages of one queue.
    ///
    /// Each id comes with its consumer group so the right pending structure
    /// is cleaned. Missing ids count as not found, PROCESSING ones as in
    /// process; neither fails the batch.
    pub async fn delete_messages(
        &self,
        queue: &QueueParams,
        messages: &[(MessageId, Option<String>)],
    ) -> SmithyResult<DeleteMessagesStats> {
        if messages.is_empty() {
            return Ok(DeleteMessagesStats::default());
        }
        if messages.len() > DELETE_BATCH_SIZE {
            return Err(SmithyError::invalid_message(format!(
                "at most {} messages can be deleted at once",
                DELETE_BATCH_SIZE
            )));
        }

        let keys = self.keys(queue);
        let mut call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(keys.messages())
            .key(keys.scheduled())
            .key(keys.delayed())
            .key(keys.requeued())
            .key(keys.acknowledged())
            .key(keys.dead_lettered())
            .arg(self.prefix());
        for (id, group) in messages {
            let group = group.as_deref();
            call = call
                .key(keys.pending(group))
                .key(keys.priority_pending(group))
                .arg(id);
        }

        let reply = self.redis.run_script(ScriptName::DeleteMessage, call).await?;
        match reply_ints(ScriptName::DeleteMessage, &reply)?.as_slice() {
            [success, not_found, in_process] => Ok(DeleteMessagesStats::from_counts(
                (*success).max(0) as u64,
                (*not_found).max(0) as u64,
                (*in_process).max(0) as u64,
            )),
            _ => Err(SmithyError::unexpected_reply(
                ScriptName::DeleteMessage.as_str(),
                &reply,
            )),
        }
    }
}
