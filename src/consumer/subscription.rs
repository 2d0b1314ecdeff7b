//! Registration of consumers on queues.
//!
//! Subscribing is scripted (SUBSCRIBE_CONSUMER). Unregistering is a WATCH
//! transaction because it must only happen while the consumer's processing
//! marker is empty: the offline consumer reaper gives held messages back
//! first, and a message landing in the marker meanwhile aborts the EXEC.

use crate::config::WatchConfig;
use crate::consumer::ConsumerInfo;
use crate::error::SmithyResult;
use crate::keys::{QueueKeys, RedisKeys};
use crate::queue::QueueParams;
use crate::redis_client::scripts::reply_ok;
use crate::redis_client::watch::query_as;
use crate::redis_client::{
    PreparedTransaction, RedisClient, ScriptCall, ScriptName, WatchAttempt, WatchConnection,
    WatchOptions, run_watch_transaction,
};
use async_trait::async_trait;

/// Register `info` as a consumer of `queue`
pub async fn subscribe(
    redis: &RedisClient,
    info: &ConsumerInfo,
    queue: &QueueParams,
    consumer_group: Option<&str>,
) -> SmithyResult<()> {
    let keys = redis.keys().queue(queue);
    let call = ScriptCall::new(queue.to_string())
        .target(consumer_group.unwrap_or_default())
        .key(keys.properties())
        .key(keys.consumers())
        .key(keys.processing_queues())
        .key(redis.keys().consumer_queues(&info.consumer_id))
        .key(keys.consumer_groups())
        .arg(&info.consumer_id)
        .arg(serde_json::to_string(info)?)
        .arg(keys.processing(&info.consumer_id))
        .arg(queue)
        .arg(consumer_group.unwrap_or_default());

    let reply = redis.run_script(ScriptName::SubscribeConsumer, call).await?;
    reply_ok(ScriptName::SubscribeConsumer, &reply)?;
    tracing::debug!(queue = %queue, consumer_id = %info.consumer_id, "consumer subscribed");
    Ok(())
}

/// Remove a consumer from a queue once it holds nothing.
///
/// With `only_if_offline`, a consumer whose heartbeat is present is left
/// alone. Returns whether the consumer was removed.
pub async fn unregister(
    redis: &RedisClient,
    watch: &WatchConfig,
    consumer_id: &str,
    queue: &QueueParams,
    only_if_offline: bool,
) -> SmithyResult<bool> {
    let attempt = Unregister {
        queue_id: queue.to_string(),
        keys: redis.keys().queue(queue),
        root: redis.keys().clone(),
        consumer_id: consumer_id.to_string(),
        only_if_offline,
    };
    let mut conn = redis.watch_connection().await?;
    let removed = run_watch_transaction(&mut conn, &attempt, &WatchOptions::from_config(watch)).await?;
    if removed {
        tracing::debug!(queue = %queue, consumer_id, "consumer unregistered");
    }
    Ok(removed)
}

struct Unregister {
    queue_id: String,
    keys: QueueKeys,
    root: RedisKeys,
    consumer_id: String,
    only_if_offline: bool,
}

#[async_trait]
impl WatchAttempt for Unregister {
    type Output = bool;

    fn watched_keys(&self) -> Vec<String> {
        vec![
            self.keys.processing(&self.consumer_id),
            self.keys.consumers(),
            self.root.consumer_heartbeat(&self.consumer_id),
        ]
    }

    async fn attempt(
        &self,
        conn: &mut dyn WatchConnection,
    ) -> SmithyResult<PreparedTransaction<bool>> {
        let processing = self.keys.processing(&self.consumer_id);
        let held: u64 = query_as(conn, redis::cmd("LLEN").arg(&processing)).await?;
        if held > 0 {
            return Ok(PreparedTransaction::skip(false));
        }
        if self.only_if_offline {
            let alive: bool = query_as(
                conn,
                redis::cmd("EXISTS").arg(self.root.consumer_heartbeat(&self.consumer_id)),
            )
            .await?;
            if alive {
                return Ok(PreparedTransaction::skip(false));
            }
        }

        let mut pipe = redis::pipe();
        pipe.hdel(self.keys.consumers(), &self.consumer_id)
            .ignore()
            .hdel(self.keys.processing_queues(), &processing)
            .ignore()
            .del(&processing)
            .ignore()
            .srem(self.root.consumer_queues(&self.consumer_id), &self.queue_id)
            .ignore();
        Ok(PreparedTransaction::commit(pipe, true))
    }
}

/// Drop the heartbeat entry of a consumer registered on no queue anymore
pub async fn forget_if_unsubscribed(redis: &RedisClient, consumer_id: &str) -> SmithyResult<bool> {
    let keys = redis.keys();
    let mut conn = redis.connection();
    let remaining: u64 = redis::cmd("SCARD")
        .arg(keys.consumer_queues(consumer_id))
        .query_async(&mut conn)
        .await?;
    if remaining > 0 {
        return Ok(false);
    }
    let mut pipe = redis::pipe();
    pipe.zrem(keys.heartbeats(), consumer_id)
        .ignore()
        .del(keys.consumer_queues(consumer_id))
        .ignore();
    pipe.query_async::<()>(&mut conn).await?;
    Ok(true)
}
