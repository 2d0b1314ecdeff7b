use super::WorkerDeps;
use crate::consumer::{emit_unacknowledged, subscription};
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::events::SmithyEvent;
use crate::message::{MessageId, UnacknowledgeReason};
use crate::queue::QueueParams;
use async_trait::async_trait;
use redis::AsyncCommands;

/// Reaps consumers whose heartbeat expired.
///
/// Every message an offline consumer still holds is unacknowledged with
/// OFFLINE_CONSUMER, then the consumer is unregistered from the queue.
/// Running twice over the same consumer is harmless: a message that left
/// the processing marker is reported as not in processing and skipped.
pub struct WatchConsumersWorker {
    deps: WorkerDeps,
}

impl WatchConsumersWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    async fn reap(&self, queue: &QueueParams, consumer_id: &str) -> SmithyResult<()> {
        let redis = &self.deps.redis;
        let processing = redis.keys().queue(queue).processing(consumer_id);
        let mut conn = redis.connection();
        let held: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        for id in held {
            let id = MessageId::from(id);
            let result = self
                .deps
                .storage
                .unacknowledge(queue, consumer_id, &id, UnacknowledgeReason::OfflineConsumer)
                .await?;
            tracing::info!(
                queue = %queue,
                consumer_id,
                message_id = %id,
                "🔨 Recovered message of offline consumer ({:?})",
                result.outcome
            );
            emit_unacknowledged(
                &self.deps.events,
                queue,
                &id,
                consumer_id,
                UnacknowledgeReason::OfflineConsumer,
                result.outcome,
            );
        }

        if subscription::unregister(redis, &self.deps.config.watch, consumer_id, queue, true).await? {
            tracing::info!(queue = %queue, consumer_id, "🔨 Offline consumer unregistered");
            if subscription::forget_if_unsubscribed(redis, consumer_id).await? {
                self.deps.events.emit(SmithyEvent::ConsumerOffline {
                    consumer_id: consumer_id.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundWorker for WatchConsumersWorker {
    fn name(&self) -> &'static str {
        "watch-consumers"
    }

    async fn work(&self) -> SmithyResult<()> {
        let batch = self.deps.config.workers.consumers_batch_size.max(1);
        let keys = self.deps.redis.keys();
        let mut conn = self.deps.redis.connection();

        for queue in self.deps.queues.get_queues().await? {
            let consumer_ids: Vec<String> = conn.hkeys(keys.queue(&queue).consumers()).await?;
            if consumer_ids.is_empty() {
                continue;
            }
            let mut pipe = redis::pipe();
            for consumer_id in &consumer_ids {
                pipe.exists(keys.consumer_heartbeat(consumer_id));
            }
            let alive: Vec<bool> = pipe.query_async(&mut conn).await?;

            for consumer_id in offline_batch(consumer_ids, &alive, batch) {
                self.reap(&queue, &consumer_id).await?;
            }
        }
        Ok(())
    }
}

/// Up to `batch` consumers whose heartbeat is gone
fn offline_batch(consumer_ids: Vec<String>, alive: &[bool], batch: usize) -> Vec<String> {
    consumer_ids
        .into_iter()
        .zip(alive.iter().copied())
        .filter(|(_, alive)| !alive)
        .map(|(consumer_id, _)| consumer_id)
        .take(batch)
        .collect()
}
