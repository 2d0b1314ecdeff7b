use super::WorkerDeps;
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::message::MessageId;
use async_trait::async_trait;
use redis::AsyncCommands;

/// Moves UNACK_DELAYING messages into the scheduled set, due after their
/// retry delay
pub struct DelayUnacknowledgedWorker {
    deps: WorkerDeps,
}

impl DelayUnacknowledgedWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl BackgroundWorker for DelayUnacknowledgedWorker {
    fn name(&self) -> &'static str {
        "delay-unacknowledged"
    }

    async fn work(&self) -> SmithyResult<()> {
        let batch = self.deps.config.workers.delay_batch_size.max(1) as isize;
        let mut conn = self.deps.redis.connection();

        for queue in self.deps.queues.get_queues().await? {
            let delayed = self.deps.redis.keys().queue(&queue).delayed();
            let ids: Vec<String> = conn.lrange(&delayed, 0, batch - 1).await?;
            for id in ids {
                let id = MessageId::from(id);
                if self.deps.storage.requeue_delayed(&queue, &id).await? {
                    tracing::debug!(queue = %queue, message_id = %id, "delayed message scheduled");
                }
            }
        }
        Ok(())
    }
}
