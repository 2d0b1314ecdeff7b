//! Consumers: message handler loops with heartbeats.
//!
//! A [`Consumer`] owns one loop per consumed queue. Each loop checks the
//! queue rate limit, checks out a message, runs the handler under the
//! message's consume timeout and acknowledges or unacknowledges the result.
//! Handlers run in their own task, so a panicking handler only fails its
//! message.
//!
//! # Examples
//!
//! ```rust,no_run
//! use smithymq::prelude::*;
//!
//! # async fn example(smithy: Smithy) -> SmithyResult<()> {
//! let queue: QueueParams = "orders@shop".parse()?;
//! let mut consumer = smithy.consumer();
//! consumer.consume(
//!     &queue,
//!     None,
//!     handler_fn(|message: MessageEnvelope| async move {
//!         tracing::info!("got {}", message.message.body);
//!         Ok::<_, HandlerError>(())
//!     }),
//! )?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConsumerConfig, DurationExt, WatchConfig};
use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use crate::message::{MessageEnvelope, MessageId, MessageManager, UnacknowledgeOutcome, UnacknowledgeReason};
use crate::queue::{QueueManager, QueueParams, validate_name};
use crate::redis_client::RedisClient;
use crate::storage::MessageStorage;
use crate::utils::{calculate_backoff, now_ms};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub mod heartbeat;
pub mod subscription;

pub use heartbeat::{Heartbeat, HeartbeatPayload};

/// Registration record of a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: String,
    pub pid: u32,
    pub hostname: Option<String>,
    /// Start time (ms)
    pub created_at: u64,
}

impl ConsumerInfo {
    /// Identity of a consumer running in this process
    pub fn current(consumer_id: &str) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            created_at: now_ms(),
        }
    }
}

/// Why a handler did not consume a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Failed; the message is retried while attempts remain
    Failed(String),
    /// Refused; the message is dead-lettered without retry
    Rejected(String),
}

impl HandlerError {
    fn reason(&self) -> UnacknowledgeReason {
        match self {
            HandlerError::Failed(_) => UnacknowledgeReason::ConsumeError,
            HandlerError::Rejected(_) => UnacknowledgeReason::Rejected,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Failed(msg) => write!(f, "failed: {}", msg),
            HandlerError::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Processes messages of a queue
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message; `Ok` acknowledges it
    async fn handle(&self, message: MessageEnvelope) -> Result<(), HandlerError>;
}

/// Handler built from an async closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: MessageEnvelope) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

struct Subscription {
    queue: QueueParams,
    consumer_group: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

/// A consumer of one or more queues
pub struct Consumer {
    id: String,
    redis: RedisClient,
    storage: MessageStorage,
    messages: MessageManager,
    queues: QueueManager,
    config: ConsumerConfig,
    watch: WatchConfig,
    events: SharedEventBus,
    subscriptions: Vec<Subscription>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    heartbeat: Option<Heartbeat>,
}

impl Consumer {
    /// Create a consumer with a fresh id
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: RedisClient,
        storage: MessageStorage,
        messages: MessageManager,
        queues: QueueManager,
        config: ConsumerConfig,
        watch: WatchConfig,
        events: SharedEventBus,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            redis,
            storage,
            messages,
            queues,
            config,
            watch,
            events,
            subscriptions: Vec::new(),
            shutdown_tx,
            tasks: Vec::new(),
            heartbeat: None,
        }
    }

    /// Consumer id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the loops are running
    pub fn is_running(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Register a handler for a queue (and consumer group for PUB_SUB
    /// queues). Must be called before [`Consumer::run`].
    pub fn consume(
        &mut self,
        queue: &QueueParams,
        consumer_group: Option<&str>,
        handler: impl MessageHandler,
    ) -> SmithyResult<()> {
        if self.is_running() {
            return Err(SmithyError::AlreadyRunning);
        }
        let consumer_group = consumer_group
            .map(|g| validate_name("consumer group", g))
            .transpose()?;
        if self
            .subscriptions
            .iter()
            .any(|s| &s.queue == queue && s.consumer_group == consumer_group)
        {
            return Err(SmithyError::config(format!(
                "a handler for '{}' is already registered",
                queue
            )));
        }
        self.subscriptions.push(Subscription {
            queue: queue.clone(),
            consumer_group,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Start the heartbeat, subscribe to every queue and start the loops
    pub async fn run(&mut self) -> SmithyResult<()> {
        if self.is_running() {
            return Err(SmithyError::AlreadyRunning);
        }
        let info = ConsumerInfo::current(&self.id);
        let heartbeat = Heartbeat::start(self.redis.clone(), info.clone(), &self.config).await?;
        self.heartbeat = Some(heartbeat);
        self.shutdown_tx.send_replace(false);

        if let Err(e) = self.start_loops(&info).await {
            tracing::error!(consumer_id = %self.id, "🔨 Consumer failed to start: {}", e);
            if let Err(cleanup) = self.shutdown().await {
                tracing::warn!(consumer_id = %self.id, "Cleanup after failed start: {}", cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            consumer_id = %self.id,
            "🔨 Consumer running on {} queue(s)",
            self.subscriptions.len()
        );
        Ok(())
    }

    async fn start_loops(&mut self, info: &ConsumerInfo) -> SmithyResult<()> {
        for subscription in &self.subscriptions {
            let group = subscription.consumer_group.as_deref();
            if let Some(group) = group {
                self.queues
                    .create_consumer_group(&subscription.queue, group)
                    .await?;
            }
            subscription::subscribe(&self.redis, info, &subscription.queue, group).await?;

            let worker = MessageLoop {
                consumer_id: self.id.clone(),
                queue: subscription.queue.clone(),
                consumer_group: subscription.consumer_group.clone(),
                handler: subscription.handler.clone(),
                storage: self.storage.clone(),
                messages: self.messages.clone(),
                queues: self.queues.clone(),
                config: self.config.clone(),
                events: self.events.clone(),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(worker.run(shutdown_rx)));
        }
        Ok(())
    }

    /// Stop the loops, then unregister and stop the heartbeat.
    ///
    /// A loop finishes the message it is handling before it stops.
    pub async fn shutdown(&mut self) -> SmithyResult<()> {
        let Some(heartbeat) = self.heartbeat.take() else {
            return Err(SmithyError::NotRunning);
        };
        tracing::info!(consumer_id = %self.id, "🔨 Shutting down consumer");

        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(consumer_id = %self.id, "🔨 Message loop ended badly: {}", e);
            }
        }

        for subscription in &self.subscriptions {
            if let Err(e) = subscription::unregister(
                &self.redis,
                &self.watch,
                &self.id,
                &subscription.queue,
                false,
            )
            .await
            {
                // the reaper finishes the job once the heartbeat is gone
                tracing::warn!(
                    consumer_id = %self.id,
                    queue = %subscription.queue,
                    "Could not unregister consumer: {}",
                    e
                );
            }
        }
        heartbeat.stop().await?;
        subscription::forget_if_unsubscribed(&self.redis, &self.id).await?;

        tracing::info!(consumer_id = %self.id, "🔨 Consumer stopped");
        Ok(())
    }
}

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Handled,
    Empty,
    RateLimited,
}

struct MessageLoop {
    consumer_id: String,
    queue: QueueParams,
    consumer_group: Option<String>,
    handler: Arc<dyn MessageHandler>,
    storage: MessageStorage,
    messages: MessageManager,
    queues: QueueManager,
    config: ConsumerConfig,
    events: SharedEventBus,
}

/// Exponential idle backoff, capped
fn idle_backoff(empty_polls: u32, config: &ConsumerConfig) -> Duration {
    let exp = empty_polls.saturating_sub(1).min(16);
    let delay = config
        .idle_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_idle_backoff_ms.max(config.idle_backoff_ms));
    Duration::from_millis(delay)
}

impl MessageLoop {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(
            consumer_id = %self.consumer_id,
            queue = %self.queue,
            "🔨 Message loop started"
        );
        let mut empty_polls = 0u32;
        let mut errors = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let pause = match self.tick().await {
                Ok(Tick::Handled) => {
                    empty_polls = 0;
                    errors = 0;
                    continue;
                }
                Ok(Tick::Empty) => {
                    empty_polls = empty_polls.saturating_add(1);
                    idle_backoff(empty_polls, &self.config)
                }
                Ok(Tick::RateLimited) => self.config.rate_limit_backoff_ms.millis(),
                Err(e) => {
                    errors = errors.saturating_add(1);
                    let backoff = calculate_backoff(errors, self.consumer_id.len() as u64);
                    tracing::error!(
                        consumer_id = %self.consumer_id,
                        queue = %self.queue,
                        "🔨 Consume error, backing off {}ms: {}",
                        backoff,
                        e
                    );
                    Duration::from_millis(backoff)
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::debug!(
            consumer_id = %self.consumer_id,
            queue = %self.queue,
            "🔨 Message loop stopped"
        );
    }

    async fn tick(&self) -> SmithyResult<Tick> {
        let rate_limit = self.queues.get_rate_limit(&self.queue).await?;
        if let Some(rate_limit) = &rate_limit {
            if self
                .queues
                .has_rate_limit_exceeded(&self.queue, rate_limit)
                .await?
            {
                return Ok(Tick::RateLimited);
            }
        }

        let Some(id) = self
            .storage
            .checkout(&self.queue, self.consumer_group.as_deref(), &self.consumer_id)
            .await?
        else {
            // only consumed messages count against the window
            if let Some(rate_limit) = &rate_limit {
                self.queues
                    .release_rate_limit_slot(&self.queue, rate_limit)
                    .await?;
            }
            return Ok(Tick::Empty);
        };

        let envelope = match self.messages.get_message_by_id(&id).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(message_id = %id, "🔨 Failed to read checked out message: {}", e);
                self.unacknowledge(&id, UnacknowledgeReason::ConsumeError).await?;
                return Err(e);
            }
        };
        if envelope.has_expired(now_ms()) {
            tracing::debug!(message_id = %id, "message expired before consumption");
            self.unacknowledge(&id, UnacknowledgeReason::TtlExpired).await?;
            return Ok(Tick::Handled);
        }

        let consume_timeout = envelope.message.consume_timeout;
        let handler = self.handler.clone();
        let mut handle = tokio::spawn(async move { handler.handle(envelope).await });

        let result = if consume_timeout > 0 {
            match timeout(Duration::from_millis(consume_timeout), &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    tracing::warn!(message_id = %id, "🔨 Handler timed out after {}ms", consume_timeout);
                    self.unacknowledge(&id, UnacknowledgeReason::Timeout).await?;
                    return Ok(Tick::Handled);
                }
            }
        } else {
            (&mut handle).await
        };

        match result {
            Ok(Ok(())) => {
                self.storage
                    .acknowledge(&self.queue, &self.consumer_id, &id)
                    .await?;
                tracing::debug!(message_id = %id, "message acknowledged");
                self.events.emit(SmithyEvent::MessageAcknowledged {
                    queue: self.queue.clone(),
                    message_id: id,
                    consumer_id: self.consumer_id.clone(),
                });
            }
            Ok(Err(e)) => {
                tracing::warn!(message_id = %id, "🔨 Handler {}", e);
                self.unacknowledge(&id, e.reason()).await?;
            }
            Err(join_error) => {
                tracing::error!(message_id = %id, "🔨 Handler panicked: {}", join_error);
                self.unacknowledge(&id, UnacknowledgeReason::ConsumeError)
                    .await?;
            }
        }
        Ok(Tick::Handled)
    }

    async fn unacknowledge(&self, id: &MessageId, reason: UnacknowledgeReason) -> SmithyResult<()> {
        let result = self
            .storage
            .unacknowledge(&self.queue, &self.consumer_id, id, reason)
            .await?;
        emit_unacknowledged(
            &self.events,
            &self.queue,
            id,
            &self.consumer_id,
            reason,
            result.outcome,
        );
        Ok(())
    }
}

/// Emit the events describing an unacknowledgement
pub(crate) fn emit_unacknowledged(
    events: &SharedEventBus,
    queue: &QueueParams,
    id: &MessageId,
    consumer_id: &str,
    reason: UnacknowledgeReason,
    outcome: UnacknowledgeOutcome,
) {
    if outcome == UnacknowledgeOutcome::NotInProcessing {
        return;
    }
    events.emit(SmithyEvent::MessageUnacknowledged {
        queue: queue.clone(),
        message_id: id.clone(),
        consumer_id: consumer_id.to_string(),
        reason,
        outcome,
    });
    match outcome {
        UnacknowledgeOutcome::DeadLettered => events.emit(SmithyEvent::MessageDeadLettered {
            queue: queue.clone(),
            message_id: id.clone(),
            reason,
        }),
        UnacknowledgeOutcome::Delayed => events.emit(SmithyEvent::MessageDelayed {
            queue: queue.clone(),
            message_id: id.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;

    #[test]
    fn test_idle_backoff_grows_and_caps() {
        let config = ConsumerConfig {
            idle_backoff_ms: 100,
            max_idle_backoff_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(idle_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(idle_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(idle_backoff(4, &config), Duration::from_millis(800));
        assert_eq!(idle_backoff(5, &config), Duration::from_millis(1_000));
        assert_eq!(idle_backoff(u32::MAX, &config), Duration::from_millis(1_000));
    }

    #[test]
    fn test_handler_error_reasons() {
        assert_eq!(
            HandlerError::Failed("boom".into()).reason(),
            UnacknowledgeReason::ConsumeError
        );
        assert_eq!(
            HandlerError::Rejected("bad payload".into()).reason(),
            UnacknowledgeReason::Rejected
        );
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|message: MessageEnvelope| async move {
            if message.message.body["ok"] == true {
                Ok(())
            } else {
                Err(HandlerError::Failed("not ok".into()))
            }
        });
        let queue = QueueParams::new("orders", "shop").unwrap();
        let build = |body| {
            MessageEnvelope::new(
                MessageId::from("m1"),
                crate::message::ProducibleMessage::new(body),
                crate::message::MessageDestination {
                    queue: queue.clone(),
                    consumer_group: None,
                },
            )
        };
        assert!(handler.handle(build(serde_json::json!({"ok": true}))).await.is_ok());
        assert!(handler.handle(build(serde_json::json!({"ok": false}))).await.is_err());
    }

    #[tokio::test]
    async fn test_unacknowledged_events() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();
        let events: SharedEventBus = Arc::new(bus);
        let queue = QueueParams::new("orders", "shop").unwrap();
        let id = MessageId::from("m1");

        emit_unacknowledged(
            &events,
            &queue,
            &id,
            "c1",
            UnacknowledgeReason::Rejected,
            UnacknowledgeOutcome::DeadLettered,
        );
        assert_eq!(rx.recv().await.unwrap().name(), "messageUnacknowledged");
        assert_eq!(rx.recv().await.unwrap().name(), "messageDeadLettered");

        // nothing happened, nothing is told
        emit_unacknowledged(
            &events,
            &queue,
            &id,
            "c1",
            UnacknowledgeReason::OfflineConsumer,
            UnacknowledgeOutcome::NotInProcessing,
        );
        assert!(rx.try_recv().is_err());
    }
}
