use super::WorkerDeps;
use crate::core::worker::BackgroundWorker;
use crate::error::SmithyResult;
use crate::events::SmithyEvent;
use crate::keys::QueueKeys;
use crate::queue::purge::PurgeJob;
use crate::queue::state::append_release;
use crate::queue::{
    QueueLockOwner, QueueOperationalState, QueueParams, QueueStateTransition,
    StateTransitionReason, fields,
};
use crate::redis_client::watch::query_as;
use crate::redis_client::{
    PreparedTransaction, WatchAttempt, WatchConnection, WatchOptions, run_watch_transaction,
};
use crate::utils::now_ms;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Releases queue locks whose owner is gone.
///
/// A queue LOCKED by a purge job is released when the job record is
/// missing, finished or has shown no sign of life for
/// `purge_job_stale_ms`. Locks of unknown owners are left alone.
pub struct RecoverOrphanedLockWorker {
    deps: WorkerDeps,
}

impl RecoverOrphanedLockWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    async fn recover(&self, queue: &QueueParams) -> SmithyResult<()> {
        let redis = &self.deps.redis;
        let keys = redis.keys().queue(queue);
        let mut conn = redis.connection();
        let (state, owner, lock_id): (Option<String>, Option<String>, Option<String>) = conn
            .hget(
                keys.properties(),
                &[fields::OPERATIONAL_STATE, fields::LOCK_OWNER, fields::LOCK_ID],
            )
            .await?;

        let locked = state.as_deref() == Some(QueueOperationalState::Locked.as_str());
        let by_purge = owner.as_deref() == Some(QueueLockOwner::PurgeJob.as_str());
        let (true, true, Some(lock_id)) = (locked, by_purge, lock_id.filter(|id| !id.is_empty()))
        else {
            return Ok(());
        };

        let attempt = ReleaseOrphanedLock {
            job_key: redis.keys().purge_job(&lock_id),
            keys,
            lock_id,
            stale_ms: self.deps.config.queue_state.purge_job_stale_ms,
            history_size: self.deps.config.queue_state.history_size,
        };
        let mut watch_conn = redis.watch_connection().await?;
        let options = WatchOptions::from_config(&self.deps.config.watch);
        if let Some(transition) = run_watch_transaction(&mut watch_conn, &attempt, &options).await? {
            tracing::warn!(
                queue = %queue,
                lock_id = ?transition.lock_id,
                "🔨 Released orphaned queue lock"
            );
            self.deps.events.emit(SmithyEvent::QueueStateChanged {
                queue: queue.clone(),
                from: transition.from,
                to: transition.to,
            });
        }
        Ok(())
    }
}

struct ReleaseOrphanedLock {
    keys: QueueKeys,
    job_key: String,
    lock_id: String,
    stale_ms: u64,
    history_size: usize,
}

#[async_trait]
impl WatchAttempt for ReleaseOrphanedLock {
    type Output = Option<QueueStateTransition>;

    fn watched_keys(&self) -> Vec<String> {
        vec![self.keys.properties(), self.job_key.clone()]
    }

    async fn attempt(
        &self,
        conn: &mut dyn WatchConnection,
    ) -> SmithyResult<PreparedTransaction<Self::Output>> {
        let (state, lock_id): (Option<String>, Option<String>) = query_as(
            conn,
            redis::cmd("HMGET")
                .arg(self.keys.properties())
                .arg(fields::OPERATIONAL_STATE)
                .arg(fields::LOCK_ID),
        )
        .await?;
        // released or re-locked meanwhile
        if state.as_deref() != Some(QueueOperationalState::Locked.as_str())
            || lock_id.as_deref() != Some(self.lock_id.as_str())
        {
            return Ok(PreparedTransaction::skip(None));
        }

        let job: HashMap<String, String> =
            query_as(conn, redis::cmd("HGETALL").arg(&self.job_key)).await?;
        let now = now_ms();
        let orphaned = match PurgeJob::from_hash(&job) {
            Ok(Some(job)) => job.is_orphaned(now, self.stale_ms),
            Ok(None) => true,
            // an unreadable record has no owner able to release the lock
            Err(_) => true,
        };
        if !orphaned {
            return Ok(PreparedTransaction::skip(None));
        }

        let transition = QueueStateTransition {
            from: QueueOperationalState::Locked,
            to: QueueOperationalState::Active,
            reason: StateTransitionReason::OrphanedLockRecovery,
            timestamp: now,
            lock_owner: Some(QueueLockOwner::PurgeJob),
            lock_id: Some(self.lock_id.clone()),
            description: Some("purge job no longer running".to_string()),
            metadata: None,
        };
        let mut pipe = redis::pipe();
        append_release(&mut pipe, &self.keys, &transition, self.history_size)?;
        Ok(PreparedTransaction::commit(pipe, Some(transition)))
    }
}

#[async_trait]
impl BackgroundWorker for RecoverOrphanedLockWorker {
    fn name(&self) -> &'static str {
        "recover-orphaned-lock"
    }

    async fn work(&self) -> SmithyResult<()> {
        for queue in self.deps.queues.get_queues().await? {
            self.recover(&queue).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RedisKeys;

    fn attempt() -> ReleaseOrphanedLock {
        let keys = RedisKeys::new("test");
        ReleaseOrphanedLock {
            keys: keys.queue(&QueueParams::new("orders", "shop").unwrap()),
            job_key: keys.purge_job("job-1"),
            lock_id: "job-1".to_string(),
            stale_ms: 60_000,
            history_size: 10,
        }
    }

    #[test]
    fn test_watches_properties_and_job() {
        let attempt = attempt();
        let keys = attempt.watched_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys[1].ends_with("job-1"));
    }
}
