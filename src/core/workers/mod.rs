//! The background workers driving time-based message transitions and
//! recovery.
//!
//! Each worker walks every queue on each tick and handles a bounded batch
//! per queue, on a Redis connection of its own.

use crate::config::SmithyConfig;
use crate::core::engine::WorkerFactory;
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::events::SharedEventBus;
use crate::queue::QueueManager;
use crate::redis_client::RedisClient;
use crate::storage::MessageStorage;
use async_trait::async_trait;
use std::sync::Arc;

mod delay_unacknowledged;
mod publish_scheduled;
mod recover_orphaned_lock;
mod requeue_immediate;
mod watch_consumers;

pub use delay_unacknowledged::DelayUnacknowledgedWorker;
pub use publish_scheduled::PublishScheduledWorker;
pub use recover_orphaned_lock::RecoverOrphanedLockWorker;
pub use requeue_immediate::RequeueImmediateWorker;
pub use watch_consumers::WatchConsumersWorker;

/// The built-in workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    DelayUnacknowledged,
    PublishScheduled,
    RequeueImmediate,
    WatchConsumers,
    RecoverOrphanedLock,
}

impl WorkerKind {
    /// Every built-in worker
    pub const ALL: [WorkerKind; 5] = [
        WorkerKind::DelayUnacknowledged,
        WorkerKind::PublishScheduled,
        WorkerKind::RequeueImmediate,
        WorkerKind::WatchConsumers,
        WorkerKind::RecoverOrphanedLock,
    ];

    /// Worker name used in logs and events
    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::DelayUnacknowledged => "delay-unacknowledged",
            WorkerKind::PublishScheduled => "publish-scheduled",
            WorkerKind::RequeueImmediate => "requeue-immediate",
            WorkerKind::WatchConsumers => "watch-consumers",
            WorkerKind::RecoverOrphanedLock => "recover-orphaned-lock",
        }
    }
}

/// What a worker needs to build its own resources
#[derive(Clone)]
pub struct WorkerContext {
    pub redis: RedisClient,
    pub config: SmithyConfig,
    pub events: SharedEventBus,
}

/// Shared pieces every worker is built from
pub(crate) struct WorkerDeps {
    pub redis: RedisClient,
    pub storage: MessageStorage,
    pub queues: QueueManager,
    pub config: SmithyConfig,
    pub events: SharedEventBus,
}

impl WorkerDeps {
    fn new(redis: RedisClient, context: &WorkerContext) -> Self {
        let storage = MessageStorage::new(redis.clone(), context.config.messages.clone());
        let queues = QueueManager::new(
            redis.clone(),
            context.config.watch.clone(),
            context.events.clone(),
        );
        Self {
            redis,
            storage,
            queues,
            config: context.config.clone(),
            events: context.events.clone(),
        }
    }
}

/// Builds one built-in worker on a dedicated connection
pub struct WorkerSpec {
    kind: WorkerKind,
    context: Arc<WorkerContext>,
}

impl WorkerSpec {
    /// Factory for `kind`
    pub fn new(kind: WorkerKind, context: Arc<WorkerContext>) -> Self {
        Self { kind, context }
    }

    /// Factories for every built-in worker
    pub fn all(context: Arc<WorkerContext>) -> Vec<Arc<dyn WorkerFactory>> {
        WorkerKind::ALL
            .into_iter()
            .map(|kind| Arc::new(Self::new(kind, context.clone())) as Arc<dyn WorkerFactory>)
            .collect()
    }
}

#[async_trait]
impl WorkerFactory for WorkerSpec {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    async fn build(&self) -> SmithyResult<Box<dyn BackgroundWorker>> {
        let redis = self.context.redis.dedicated().await?;
        let deps = WorkerDeps::new(redis, &self.context);
        Ok(match self.kind {
            WorkerKind::DelayUnacknowledged => Box::new(DelayUnacknowledgedWorker::new(deps)),
            WorkerKind::PublishScheduled => Box::new(PublishScheduledWorker::new(deps)),
            WorkerKind::RequeueImmediate => Box::new(RequeueImmediateWorker::new(deps)),
            WorkerKind::WatchConsumers => Box::new(WatchConsumersWorker::new(deps)),
            WorkerKind::RecoverOrphanedLock => Box::new(RecoverOrphanedLockWorker::new(deps)),
        })
    }
}
