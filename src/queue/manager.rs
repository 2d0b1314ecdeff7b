//! Queue administration: lifecycle, consumer groups, rate limits and fanout
//! exchange bindings.

use crate::config::WatchConfig;
use crate::consumer::ConsumerInfo;
use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use crate::keys::QueueKeys;
use crate::queue::{
    DeliveryModel, QueueMessageCounts, QueueParams, QueueProperties, QueueRateLimit, QueueType,
    fields, validate_name,
};
use crate::redis_client::scripts::{reply_int, reply_ok};
use crate::redis_client::watch::query_as;
use crate::redis_client::{
    PreparedTransaction, RedisClient, ScriptCall, ScriptName, WatchAttempt, WatchConnection,
    WatchOptions, run_watch_transaction,
};
use crate::utils::now_ms;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Administrative operations on queues
#[derive(Clone)]
pub struct QueueManager {
    redis: RedisClient,
    watch: WatchConfig,
    events: SharedEventBus,
}

impl QueueManager {
    /// Create a queue manager
    pub fn new(redis: RedisClient, watch: WatchConfig, events: SharedEventBus) -> Self {
        Self {
            redis,
            watch,
            events,
        }
    }

    fn keys(&self, queue: &QueueParams) -> QueueKeys {
        self.redis.keys().queue(queue)
    }

    /// Create a queue; fails with `QueueAlreadyExists` if it exists
    pub async fn create_queue(
        &self,
        queue: &QueueParams,
        queue_type: QueueType,
        delivery_model: DeliveryModel,
    ) -> SmithyResult<QueueProperties> {
        let keys = self.keys(queue);
        let root = self.redis.keys();
        let call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(root.queues())
            .key(root.namespaces())
            .key(root.namespace_queues(&queue.ns))
            .arg(queue)
            .arg(&queue.ns)
            .arg(queue_type.code())
            .arg(delivery_model.code())
            .arg(now_ms());

        let reply = self.redis.run_script(ScriptName::CreateQueue, call).await?;
        reply_ok(ScriptName::CreateQueue, &reply)?;

        tracing::info!(
            queue = %queue,
            "🔨 Queue created ({:?}, {:?})",
            queue_type,
            delivery_model
        );
        self.events.emit(SmithyEvent::QueueCreated {
            queue: queue.clone(),
        });
        self.get_properties(queue).await
    }

    /// Whether the queue exists
    pub async fn queue_exists(&self, queue: &QueueParams) -> SmithyResult<bool> {
        let mut conn = self.redis.connection();
        Ok(conn.exists(self.keys(queue).properties()).await?)
    }

    /// Settings, counters and operational state of a queue
    pub async fn get_properties(&self, queue: &QueueParams) -> SmithyResult<QueueProperties> {
        let mut conn = self.redis.connection();
        let hash: HashMap<String, String> = conn.hgetall(self.keys(queue).properties()).await?;
        QueueProperties::from_hash(&hash)?.ok_or_else(|| SmithyError::QueueNotFound {
            queue: queue.to_string(),
        })
    }

    /// Every queue of every namespace
    pub async fn get_queues(&self) -> SmithyResult<Vec<QueueParams>> {
        let mut conn = self.redis.connection();
        let members: Vec<String> = conn.smembers(self.redis.keys().queues()).await?;
        Ok(parse_queue_set(members))
    }

    /// Queues of a namespace
    pub async fn get_namespace_queues(&self, ns: &str) -> SmithyResult<Vec<QueueParams>> {
        let ns = validate_name("namespace", ns)?;
        let mut conn = self.redis.connection();
        let members: Vec<String> = conn
            .smembers(self.redis.keys().namespace_queues(&ns))
            .await?;
        Ok(parse_queue_set(members))
    }

    /// Namespaces holding at least one queue
    pub async fn get_namespaces(&self) -> SmithyResult<Vec<String>> {
        let mut conn = self.redis.connection();
        let mut namespaces: Vec<String> = conn.smembers(self.redis.keys().namespaces()).await?;
        namespaces.sort();
        Ok(namespaces)
    }

    /// Delete an empty queue with no online consumer and no bound exchange
    pub async fn delete_queue(&self, queue: &QueueParams) -> SmithyResult<()> {
        let keys = self.keys(queue);
        let root = self.redis.keys();

        let mut conn = self.redis.connection();
        let groups: Vec<String> = conn.smembers(keys.consumer_groups()).await?;

        let mut extra = vec![
            keys.pending(None),
            keys.priority_pending(None),
            keys.scheduled(),
            keys.delayed(),
            keys.requeued(),
            keys.acknowledged(),
            keys.dead_lettered(),
            keys.messages(),
            keys.consumer_groups(),
            keys.rate_limit_counter(),
            keys.state_history(),
        ];
        for group in &groups {
            extra.push(keys.pending(Some(group)));
            extra.push(keys.priority_pending(Some(group)));
        }

        let call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(root.queues())
            .key(root.namespaces())
            .key(root.namespace_queues(&queue.ns))
            .key(keys.consumers())
            .key(keys.processing_queues())
            .keys(extra)
            .arg(queue)
            .arg(&queue.ns)
            .arg(root.consumer_prefix())
            .arg(":heartbeat")
            .arg(":queues");

        let reply = self.redis.run_script(ScriptName::DeleteQueue, call).await?;
        reply_ok(ScriptName::DeleteQueue, &reply)?;

        tracing::info!(queue = %queue, "🔨 Queue deleted");
        self.events.emit(SmithyEvent::QueueDeleted {
            queue: queue.clone(),
        });
        Ok(())
    }

    /// Per-status counters and total
    pub async fn get_message_counts(&self, queue: &QueueParams) -> SmithyResult<QueueMessageCounts> {
        Ok(self.get_properties(queue).await?.counts)
    }

    /// Create a consumer group of a PUB_SUB queue.
    ///
    /// Returns `false` when the group already existed.
    pub async fn create_consumer_group(
        &self,
        queue: &QueueParams,
        consumer_group: &str,
    ) -> SmithyResult<bool> {
        let group = validate_name("consumer group", consumer_group)?;
        let attempt = CreateConsumerGroup {
            queue: queue.clone(),
            keys: self.keys(queue),
            group: group.clone(),
        };

        let mut conn = self.redis.watch_connection().await?;
        let created =
            run_watch_transaction(&mut conn, &attempt, &WatchOptions::from_config(&self.watch))
                .await?;

        if created {
            tracing::info!(queue = %queue, consumer_group = %group, "🔨 Consumer group created");
            self.events.emit(SmithyEvent::ConsumerGroupCreated {
                queue: queue.clone(),
                consumer_group: group,
            });
        }
        Ok(created)
    }

    /// Delete a consumer group that holds no message copies: nothing
    /// pending, and no delayed, requeued or scheduled copy bound to it
    pub async fn delete_consumer_group(
        &self,
        queue: &QueueParams,
        consumer_group: &str,
    ) -> SmithyResult<()> {
        let keys = self.keys(queue);
        let call = ScriptCall::new(queue.to_string())
            .target(consumer_group)
            .key(keys.properties())
            .key(keys.consumer_groups())
            .key(keys.pending(Some(consumer_group)))
            .key(keys.priority_pending(Some(consumer_group)))
            .key(keys.delayed())
            .key(keys.requeued())
            .key(keys.scheduled())
            .arg(consumer_group)
            .arg(self.redis.keys().message_prefix());

        let reply = self
            .redis
            .run_script(ScriptName::DeleteConsumerGroup, call)
            .await?;
        reply_ok(ScriptName::DeleteConsumerGroup, &reply)?;

        tracing::info!(queue = %queue, consumer_group, "🔨 Consumer group deleted");
        self.events.emit(SmithyEvent::ConsumerGroupDeleted {
            queue: queue.clone(),
            consumer_group: consumer_group.to_string(),
        });
        Ok(())
    }

    /// Consumer groups of a queue, sorted
    pub async fn get_consumer_groups(&self, queue: &QueueParams) -> SmithyResult<Vec<String>> {
        let mut conn = self.redis.connection();
        let mut groups: Vec<String> = conn.smembers(self.keys(queue).consumer_groups()).await?;
        groups.sort();
        Ok(groups)
    }

    /// Set or replace the rate limit of a queue
    pub async fn set_rate_limit(
        &self,
        queue: &QueueParams,
        rate_limit: QueueRateLimit,
    ) -> SmithyResult<()> {
        rate_limit.validate()?;
        let call = ScriptCall::new(queue.to_string())
            .key(self.keys(queue).properties())
            .arg(serde_json::to_string(&rate_limit)?);

        let reply = self
            .redis
            .run_script(ScriptName::SetQueueRateLimit, call)
            .await?;
        reply_ok(ScriptName::SetQueueRateLimit, &reply)?;
        tracing::debug!(queue = %queue, "rate limit set to {:?}", rate_limit);
        Ok(())
    }

    /// Rate limit of a queue, if any
    pub async fn get_rate_limit(&self, queue: &QueueParams) -> SmithyResult<Option<QueueRateLimit>> {
        Ok(self.get_properties(queue).await?.rate_limit)
    }

    /// Remove the rate limit and reset its window
    pub async fn clear_rate_limit(&self, queue: &QueueParams) -> SmithyResult<()> {
        let keys = self.keys(queue);
        let call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(keys.rate_limit_counter());

        let reply = self
            .redis
            .run_script(ScriptName::ClearQueueRateLimit, call)
            .await?;
        reply_ok(ScriptName::ClearQueueRateLimit, &reply)
    }

    /// Count one consumption in the current window; `true` when the window
    /// is exhausted
    pub async fn has_rate_limit_exceeded(
        &self,
        queue: &QueueParams,
        rate_limit: &QueueRateLimit,
    ) -> SmithyResult<bool> {
        let call = ScriptCall::new(queue.to_string())
            .key(self.keys(queue).rate_limit_counter())
            .arg(rate_limit.limit)
            .arg(rate_limit.interval);

        let reply = self
            .redis
            .run_script(ScriptName::CheckQueueRateLimit, call)
            .await?;
        Ok(reply_int(ScriptName::CheckQueueRateLimit, &reply)? == 1)
    }

    /// Give back a slot counted by [`has_rate_limit_exceeded`] when the
    /// poll it allowed found no message
    ///
    /// [`has_rate_limit_exceeded`]: QueueManager::has_rate_limit_exceeded
    pub async fn release_rate_limit_slot(
        &self,
        queue: &QueueParams,
        rate_limit: &QueueRateLimit,
    ) -> SmithyResult<()> {
        let call = ScriptCall::new(queue.to_string())
            .key(self.keys(queue).rate_limit_counter())
            .arg(rate_limit.limit)
            .arg(rate_limit.interval)
            .arg("release");

        let reply = self
            .redis
            .run_script(ScriptName::CheckQueueRateLimit, call)
            .await?;
        reply_int(ScriptName::CheckQueueRateLimit, &reply)?;
        Ok(())
    }

    /// Bind a queue to a fanout exchange of its namespace.
    ///
    /// A queue is bound to at most one exchange, and every queue of an
    /// exchange has the same queue type.
    pub async fn bind_fanout_exchange(&self, exchange: &str, queue: &QueueParams) -> SmithyResult<()> {
        let exchange = validate_name("exchange", exchange)?;
        let attempt = BindFanoutExchange {
            queue: queue.clone(),
            keys: self.keys(queue),
            exchange_key: self.redis.keys().fanout_exchange_queues(&queue.ns, &exchange),
            exchange: exchange.clone(),
            key_prefix: self.redis.keys().clone(),
        };

        let mut conn = self.redis.watch_connection().await?;
        let bound =
            run_watch_transaction(&mut conn, &attempt, &WatchOptions::from_config(&self.watch))
                .await?;
        if bound {
            tracing::info!(queue = %queue, exchange = %exchange, "🔨 Queue bound to fanout exchange");
        }
        Ok(())
    }

    /// Remove the binding of a queue to a fanout exchange
    pub async fn unbind_fanout_exchange(
        &self,
        exchange: &str,
        queue: &QueueParams,
    ) -> SmithyResult<()> {
        let exchange = validate_name("exchange", exchange)?;
        let attempt = UnbindFanoutExchange {
            queue: queue.clone(),
            keys: self.keys(queue),
            exchange_key: self.redis.keys().fanout_exchange_queues(&queue.ns, &exchange),
            exchange: exchange.clone(),
        };

        let mut conn = self.redis.watch_connection().await?;
        run_watch_transaction(&mut conn, &attempt, &WatchOptions::from_config(&self.watch)).await?;
        tracing::info!(queue = %queue, exchange = %exchange, "🔨 Queue unbound from fanout exchange");
        Ok(())
    }

    /// Queues bound to a fanout exchange
    pub async fn get_exchange_queues(
        &self,
        ns: &str,
        exchange: &str,
    ) -> SmithyResult<Vec<QueueParams>> {
        let ns = validate_name("namespace", ns)?;
        let exchange = validate_name("exchange", exchange)?;
        let mut conn = self.redis.connection();
        let members: Vec<String> = conn
            .smembers(self.redis.keys().fanout_exchange_queues(&ns, &exchange))
            .await?;
        Ok(parse_queue_set(members))
    }

    /// Consumers registered on a queue, by id
    pub async fn get_queue_consumers(
        &self,
        queue: &QueueParams,
    ) -> SmithyResult<HashMap<String, ConsumerInfo>> {
        let mut conn = self.redis.connection();
        let raw: HashMap<String, String> = conn.hgetall(self.keys(queue).consumers()).await?;

        let mut consumers = HashMap::with_capacity(raw.len());
        for (id, json) in raw {
            match serde_json::from_str::<ConsumerInfo>(&json) {
                Ok(info) => {
                    consumers.insert(id, info);
                }
                Err(e) => {
                    tracing::warn!(queue = %queue, consumer_id = %id, "Unreadable consumer info: {}", e)
                }
            }
        }
        Ok(consumers)
    }

    /// Ids of the consumers registered on a queue
    pub async fn get_queue_consumer_ids(&self, queue: &QueueParams) -> SmithyResult<Vec<String>> {
        let mut conn = self.redis.connection();
        Ok(conn.hkeys(self.keys(queue).consumers()).await?)
    }
}

/// Decode a set of `name@ns` members, skipping anything malformed
pub(crate) fn parse_queue_set(members: Vec<String>) -> Vec<QueueParams> {
    let mut queues: Vec<QueueParams> = members
        .iter()
        .filter_map(|member| match member.parse() {
            Ok(queue) => Some(queue),
            Err(e) => {
                tracing::warn!("Skipping malformed queue member '{}': {}", member, e);
                None
            }
        })
        .collect();
    queues.sort_by(|a, b| (&a.ns, &a.name).cmp(&(&b.ns, &b.name)));
    queues
}

struct CreateConsumerGroup {
    queue: QueueParams,
    keys: QueueKeys,
    group: String,
}

#[async_trait]
impl WatchAttempt for CreateConsumerGroup {
    type Output = bool;

    fn watched_keys(&self) -> Vec<String> {
        vec![self.keys.properties(), self.keys.consumer_groups()]
    }

    async fn attempt(
        &self,
        conn: &mut dyn WatchConnection,
    ) -> SmithyResult<PreparedTransaction<bool>> {
        let model: Option<u8> = query_as(
            conn,
            redis::cmd("HGET")
                .arg(self.keys.properties())
                .arg(fields::DELIVERY_MODEL),
        )
        .await?;

        match model.and_then(DeliveryModel::from_code) {
            None => {
                return Err(SmithyError::QueueNotFound {
                    queue: self.queue.to_string(),
                });
            }
            Some(DeliveryModel::PointToPoint) => {
                return Err(SmithyError::ConsumerGroupsNotSupported {
                    queue: self.queue.to_string(),
                });
            }
            Some(DeliveryModel::PubSub) => {}
        }

        let exists: bool = query_as(
            conn,
            redis::cmd("SISMEMBER")
                .arg(self.keys.consumer_groups())
                .arg(&self.group),
        )
        .await?;
        if exists {
            return Ok(PreparedTransaction::skip(false));
        }

        let mut pipe = redis::pipe();
        pipe.sadd(self.keys.consumer_groups(), &self.group).ignore();
        Ok(PreparedTransaction::commit(pipe, true))
    }
}

struct BindFanoutExchange {
    queue: QueueParams,
    keys: QueueKeys,
    exchange_key: String,
    exchange: String,
    key_prefix: crate::keys::RedisKeys,
}

#[async_trait]
impl WatchAttempt for BindFanoutExchange {
    type Output = bool;

    fn watched_keys(&self) -> Vec<String> {
        vec![self.keys.properties(), self.exchange_key.clone()]
    }

    async fn attempt(
        &self,
        conn: &mut dyn WatchConnection,
    ) -> SmithyResult<PreparedTransaction<bool>> {
        let hash: HashMap<String, String> =
            query_as(conn, redis::cmd("HGETALL").arg(self.keys.properties())).await?;
        let Some(props) = QueueProperties::from_hash(&hash)? else {
            return Err(SmithyError::QueueNotFound {
                queue: self.queue.to_string(),
            });
        };

        match props.exchange.as_deref() {
            Some(bound) if bound == self.exchange => return Ok(PreparedTransaction::skip(false)),
            Some(bound) => {
                return Err(SmithyError::ExchangeBinding {
                    message: format!("queue '{}' is already bound to '{}'", self.queue, bound),
                });
            }
            None => {}
        }

        let members: Vec<String> =
            query_as(conn, redis::cmd("SMEMBERS").arg(&self.exchange_key)).await?;
        if let Some(other) = parse_queue_set(members).into_iter().next() {
            // queue types never change, so reading one bound queue is enough
            let other_type: Option<u8> = query_as(
                conn,
                redis::cmd("HGET")
                    .arg(self.key_prefix.queue(&other).properties())
                    .arg(fields::QUEUE_TYPE),
            )
            .await?;
            if other_type.and_then(QueueType::from_code) != Some(props.queue_type) {
                return Err(SmithyError::ExchangeBinding {
                    message: format!(
                        "exchange '{}' only accepts queues of the same type as '{}'",
                        self.exchange, other
                    ),
                });
            }
        }

        let mut pipe = redis::pipe();
        pipe.hset(self.keys.properties(), fields::EXCHANGE, &self.exchange)
            .ignore()
            .sadd(&self.exchange_key, self.queue.to_string())
            .ignore();
        Ok(PreparedTransaction::commit(pipe, true))
    }
}

struct UnbindFanoutExchange {
    queue: QueueParams,
    keys: QueueKeys,
    exchange_key: String,
    exchange: String,
}

#[async_trait]
impl WatchAttempt for UnbindFanoutExchange {
    type Output = ();

    fn watched_keys(&self) -> Vec<String> {
        vec![self.keys.properties(), self.exchange_key.clone()]
    }

    async fn attempt(&self, conn: &mut dyn WatchConnection) -> SmithyResult<PreparedTransaction<()>> {
        let exists: bool = query_as(conn, redis::cmd("EXISTS").arg(self.keys.properties())).await?;
        if !exists {
            return Err(SmithyError::QueueNotFound {
                queue: self.queue.to_string(),
            });
        }

        let bound: Option<String> = query_as(
            conn,
            redis::cmd("HGET")
                .arg(self.keys.properties())
                .arg(fields::EXCHANGE),
        )
        .await?;
        if bound.as_deref() != Some(self.exchange.as_str()) {
            return Err(SmithyError::ExchangeBinding {
                message: format!(
                    "queue '{}' is not bound to exchange '{}'",
                    self.queue, self.exchange
                ),
            });
        }

        let mut pipe = redis::pipe();
        pipe.hdel(self.keys.properties(), fields::EXCHANGE)
            .ignore()
            .srem(&self.exchange_key, self.queue.to_string())
            .ignore();
        Ok(PreparedTransaction::commit(pipe, ()))
    }
}
