use super::WorkerDeps;
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::message::{MessageId, fields};
use async_trait::async_trait;
use redis::AsyncCommands;

/// Moves UNACK_REQUEUING messages straight back into pending
pub struct RequeueImmediateWorker {
    deps: WorkerDeps,
}

impl RequeueImmediateWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl BackgroundWorker for RequeueImmediateWorker {
    fn name(&self) -> &'static str {
        "requeue-immediate"
    }

    async fn work(&self) -> SmithyResult<()> {
        let batch = self.deps.config.workers.requeue_batch_size.max(1) as isize;
        let keys = self.deps.redis.keys();
        let mut conn = self.deps.redis.connection();

        for queue in self.deps.queues.get_queues().await? {
            let ids: Vec<String> = conn.lrange(keys.queue(&queue).requeued(), 0, batch - 1).await?;
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hget(keys.message(id), fields::CONSUMER_GROUP_ID);
            }
            let groups: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

            for (id, group) in ids.into_iter().zip(groups) {
                let id = MessageId::from(id);
                let group = group.filter(|g| !g.is_empty());
                if self
                    .deps
                    .storage
                    .requeue_immediate(&queue, &id, group.as_deref())
                    .await?
                {
                    tracing::debug!(queue = %queue, message_id = %id, "message requeued");
                }
            }
        }
        Ok(())
    }
}
