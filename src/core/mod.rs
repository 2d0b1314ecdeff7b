//! The main Smithy handle and its background machinery.
//!
//! [`Smithy`] owns the Redis connection and hands out the managers,
//! producers and consumers built on it. Starting it runs the background
//! workers that move delayed, requeued and scheduled messages and recover
//! from offline consumers and orphaned queue locks.

use crate::config::SmithyConfig;
use crate::consumer::Consumer;
use crate::error::{SmithyError, SmithyResult};
use crate::events::{self, SharedEventBus};
use crate::message::MessageManager;
use crate::producer::Producer;
use crate::queue::{QueueManager, QueuePurger, QueueStateManager};
use crate::redis_client::RedisClient;
use crate::storage::MessageStorage;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod worker;
pub mod workers;

pub use engine::{WorkerFactory, WorkerSupervisor};
pub use worker::{BackgroundWorker, DeadWorker, WorkerExit, WorkerRunner};
pub use workers::{WorkerContext, WorkerKind, WorkerSpec};

/// Entry point of SmithyMQ.
///
/// # Examples
///
/// ```rust,no_run
/// use smithymq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> SmithyResult<()> {
///     let smithy = Smithy::new(SmithyConfig::default()).await?;
///     smithy.start().await?;
///
///     let queue = QueueParams::new("orders", "shop")?;
///     smithy
///         .queues()
///         .create_queue(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
///         .await?;
///
///     smithy.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Smithy {
    config: SmithyConfig,
    redis: RedisClient,
    events: SharedEventBus,
    storage: MessageStorage,
    queues: QueueManager,
    state: QueueStateManager,
    messages: MessageManager,
    purger: QueuePurger,
    supervisor: RwLock<Option<WorkerSupervisor>>,
}

impl Smithy {
    /// Connect with the given configuration; events are discarded.
    pub async fn new(config: SmithyConfig) -> SmithyResult<Self> {
        Self::with_events(config, events::noop()).await
    }

    /// Connect with the given configuration, publishing events to `events`.
    pub async fn with_events(config: SmithyConfig, events: SharedEventBus) -> SmithyResult<Self> {
        config
            .validate()
            .map_err(|errors| SmithyError::config(errors.join("; ")))?;

        let redis = RedisClient::connect(&config.redis).await?;
        let storage = MessageStorage::new(redis.clone(), config.messages.clone());
        let queues = QueueManager::new(redis.clone(), config.watch.clone(), events.clone());
        let state = QueueStateManager::new(redis.clone(), config.queue_state.clone(), events.clone());
        let messages = MessageManager::new(storage.clone(), events.clone());
        let purger = QueuePurger::new(storage.clone(), state.clone(), config.queue_state.clone());

        tracing::info!(
            namespace = %config.namespace,
            prefix = %config.redis.key_prefix,
            "🔨 Smithy connected"
        );
        Ok(Self {
            config,
            redis,
            events,
            storage,
            queues,
            state,
            messages,
            purger,
            supervisor: RwLock::new(None),
        })
    }

    /// Queue administration
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Queue operational state and locks
    pub fn state(&self) -> &QueueStateManager {
        &self.state
    }

    /// Message browsing, requeueing and deletion
    pub fn messages(&self) -> &MessageManager {
        &self.messages
    }

    /// Lock-guarded queue purges
    pub fn purger(&self) -> &QueuePurger {
        &self.purger
    }

    /// A producer sharing this connection
    pub fn producer(&self) -> Producer {
        Producer::new(self.storage.clone(), self.queues.clone(), self.events.clone())
    }

    /// A new consumer with its own id. Register handlers, then call
    /// [`Consumer::run`].
    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.redis.clone(),
            self.storage.clone(),
            self.messages.clone(),
            self.queues.clone(),
            self.config.consumer.clone(),
            self.config.watch.clone(),
            self.events.clone(),
        )
    }

    /// The underlying Redis client
    pub fn redis(&self) -> &RedisClient {
        &self.redis
    }

    /// Low-level message storage operations
    pub fn storage(&self) -> &MessageStorage {
        &self.storage
    }

    /// Event bus events are published to
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// Start the background workers. Does nothing when workers are
    /// disabled in the configuration.
    pub async fn start(&self) -> SmithyResult<()> {
        let mut guard = self.supervisor.write().await;
        if guard.is_some() {
            return Err(SmithyError::AlreadyRunning);
        }
        if !self.config.workers.enabled {
            tracing::info!("🔨 Background workers are disabled");
            return Ok(());
        }

        let context = Arc::new(WorkerContext {
            redis: self.redis.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        });
        let mut supervisor = WorkerSupervisor::new(
            self.config.workers.clone(),
            self.events.clone(),
            WorkerSpec::all(context),
        );
        supervisor.start().await?;
        *guard = Some(supervisor);

        tracing::info!("🔨 Smithy started");
        Ok(())
    }

    /// Stop the background workers
    pub async fn shutdown(&self) -> SmithyResult<()> {
        let mut guard = self.supervisor.write().await;
        let Some(mut supervisor) = guard.take() else {
            return Err(SmithyError::NotRunning);
        };
        supervisor.shutdown().await?;
        tracing::info!("🔨 Smithy stopped");
        Ok(())
    }

    /// Whether the background workers are running
    pub async fn is_running(&self) -> bool {
        self.supervisor.read().await.is_some()
    }

    /// Names of the background workers currently alive
    pub async fn running_workers(&self) -> Vec<&'static str> {
        match self.supervisor.read().await.as_ref() {
            Some(supervisor) => supervisor.running_workers().await,
            None => Vec::new(),
        }
    }

    /// Check that Redis answers
    pub async fn health_check(&self) -> SmithyResult<()> {
        self.redis.ping().await
    }

    /// Get the configuration used by this smithy.
    pub fn config(&self) -> &SmithyConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_connecting() {
        let mut config = SmithyConfig::testing();
        config.namespace = "not a namespace!".to_string();
        config.redis.connection_string = "redis://127.0.0.1:1".to_string();

        let err = Smithy::new(config).await.err().unwrap();
        assert!(matches!(err, SmithyError::ConfigError { .. }));
    }
}
