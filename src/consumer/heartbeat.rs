//! Consumer liveness.
//!
//! A running consumer refreshes a TTL'd heartbeat key every
//! `heartbeat_interval_ms` and records its last beat in the global
//! heartbeats sorted set. A consumer whose key is gone is offline.

use crate::config::{ConsumerConfig, DurationExt};
use crate::consumer::ConsumerInfo;
use crate::error::SmithyResult;
use crate::redis_client::RedisClient;
use crate::utils::now_ms;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Content of a heartbeat key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub consumer_id: String,
    /// Time of the beat (ms)
    pub timestamp: u64,
    pub info: ConsumerInfo,
}

/// Write one heartbeat
pub async fn beat(redis: &RedisClient, info: &ConsumerInfo, ttl_ms: u64) -> SmithyResult<()> {
    let payload = HeartbeatPayload {
        consumer_id: info.consumer_id.clone(),
        timestamp: now_ms(),
        info: info.clone(),
    };
    let keys = redis.keys();
    let mut pipe = redis::pipe();
    pipe.pset_ex(
        keys.consumer_heartbeat(&payload.consumer_id),
        serde_json::to_string(&payload)?,
        ttl_ms.max(1),
    )
    .ignore()
    .zadd(keys.heartbeats(), &payload.consumer_id, payload.timestamp)
    .ignore();

    let mut conn = redis.connection();
    pipe.query_async::<()>(&mut conn).await?;
    Ok(())
}

/// Whether the consumer's heartbeat key is present
pub async fn is_alive(redis: &RedisClient, consumer_id: &str) -> SmithyResult<bool> {
    let mut conn = redis.connection();
    Ok(conn
        .exists(redis.keys().consumer_heartbeat(consumer_id))
        .await?)
}

/// Last heartbeat of a consumer, `None` once it expired
pub async fn get_heartbeat(
    redis: &RedisClient,
    consumer_id: &str,
) -> SmithyResult<Option<HeartbeatPayload>> {
    let mut conn = redis.connection();
    let raw: Option<String> = conn.get(redis.keys().consumer_heartbeat(consumer_id)).await?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Periodic heartbeat of a running consumer
pub struct Heartbeat {
    redis: RedisClient,
    consumer_id: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Beat once, then keep beating in the background
    pub async fn start(
        redis: RedisClient,
        info: ConsumerInfo,
        config: &ConsumerConfig,
    ) -> SmithyResult<Self> {
        let ttl_ms = config.heartbeat_ttl_ms;
        beat(&redis, &info, ttl_ms).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = config.heartbeat_interval_ms.max(1).millis();
        let task_redis = redis.clone();
        let consumer_id = info.consumer_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = beat(&task_redis, &info, ttl_ms).await {
                            tracing::warn!(consumer_id = %info.consumer_id, "Heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!(consumer_id = %info.consumer_id, "Heartbeat stopped");
        });

        tracing::debug!(consumer_id = %consumer_id, "🔨 Heartbeat started");
        Ok(Self {
            redis,
            consumer_id,
            shutdown_tx,
            handle,
        })
    }

    /// Stop beating and remove the heartbeat so the consumer is offline
    /// right away
    pub async fn stop(self) -> SmithyResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(consumer_id = %self.consumer_id, "Heartbeat task ended badly: {}", e);
        }

        let keys = self.redis.keys();
        let mut pipe = redis::pipe();
        pipe.del(keys.consumer_heartbeat(&self.consumer_id))
            .ignore()
            .zrem(keys.heartbeats(), &self.consumer_id)
            .ignore();
        let mut conn = self.redis.connection();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json() {
        let payload = HeartbeatPayload {
            consumer_id: "c1".to_string(),
            timestamp: 42,
            info: ConsumerInfo {
                consumer_id: "c1".to_string(),
                pid: 7,
                hostname: None,
                created_at: 1,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["consumerId"], "c1");
        assert_eq!(json["info"]["pid"], 7);
        let back: HeartbeatPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
