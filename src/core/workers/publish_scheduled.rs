use super::WorkerDeps;
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::events::SmithyEvent;
use crate::message::{MessageEnvelope, MessageId, MessageState, MessageStatus, ProducibleMessage};
use crate::utils::now_ms;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Publishes scheduled messages whose time has come.
///
/// A message with a schedule is a template: a child is forked into pending
/// and the template moves on to its next firing. A message without one (a
/// retry coming back from the delayed list) is published in place.
pub struct PublishScheduledWorker {
    deps: WorkerDeps,
}

impl PublishScheduledWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

/// The message a template fires as
fn fork_child(template: &MessageEnvelope, now: u64) -> MessageEnvelope {
    let message = ProducibleMessage {
        schedule: None,
        ..template.message.clone()
    };
    let mut child = MessageEnvelope::new(MessageId::generate(), message, template.destination.clone());
    child.status = MessageStatus::Pending;
    child.state = MessageState {
        published_at: Some(now),
        scheduled_message_parent_id: Some(template.id.to_string()),
        ..Default::default()
    };
    child
}

#[async_trait]
impl BackgroundWorker for PublishScheduledWorker {
    fn name(&self) -> &'static str {
        "publish-scheduled"
    }

    async fn work(&self) -> SmithyResult<()> {
        let batch = self.deps.config.workers.scheduled_batch_size.max(1);
        let keys = self.deps.redis.keys();
        let mut conn = self.deps.redis.connection();

        for queue in self.deps.queues.get_queues().await? {
            let scheduled = keys.queue(&queue).scheduled();
            let now = now_ms();
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&scheduled)
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(batch)
                .query_async(&mut conn)
                .await?;

            for id in due {
                let hash: HashMap<String, String> = conn.hgetall(keys.message(&id)).await?;
                let Some(message) = MessageEnvelope::from_hash(&hash)? else {
                    tracing::warn!(queue = %queue, message_id = %id, "🔨 Dropping scheduled entry of a missing message");
                    let _: () = conn.zrem(&scheduled, &id).await?;
                    continue;
                };

                let published = match &message.message.schedule {
                    Some(schedule) => {
                        let child = fork_child(&message, now);
                        let next = schedule.next_timestamp(message.state.scheduled_times + 1, now)?;
                        let done = self
                            .deps
                            .storage
                            .publish_scheduled(&message, Some(&child), next)
                            .await?;
                        done.then(|| (child.id, Some(message.id.clone())))
                    }
                    None => {
                        let done = self.deps.storage.publish_scheduled(&message, None, None).await?;
                        done.then(|| (message.id.clone(), None))
                    }
                };

                if let Some((message_id, parent_id)) = published {
                    tracing::debug!(queue = %queue, message_id = %message_id, "scheduled message published");
                    self.deps.events.emit(SmithyEvent::MessageScheduled {
                        queue: queue.clone(),
                        message_id,
                        parent_id,
                    });
                }
            }
        }
        Ok(())
    }
}
