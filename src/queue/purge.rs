//! Queue purge jobs.
//!
//! A purge locks the queue (owner `PURGE_JOB`, lock id = job id), then walks
//! the queue's message set in batches and deletes everything that is not
//! held by a consumer. The job record is touched after every batch so the
//! orphaned lock recovery can tell a live purge from a dead one.

use crate::config::QueueStateConfig;
use crate::error::{SmithyError, SmithyResult};
use crate::message::{MessageId, fields as message_fields};
use crate::queue::{
    QueueLockOwner, QueueParams, QueueStateManager, StateTransitionOptions, StateTransitionReason,
};
use crate::storage::{DeleteMessagesStats, MessageStorage};
use crate::utils::now_ms;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Completed and failed job records are kept this long
const FINISHED_JOB_TTL_MS: i64 = 24 * 60 * 60 * 1000;

mod fields {
    pub const ID: &str = "id";
    pub const QUEUE: &str = "queue";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const DELETED: &str = "deleted";
    pub const ERROR: &str = "error";
}

/// Lifecycle of a purge job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurgeJobStatus {
    Running,
    Completed,
    Failed,
}

impl PurgeJobStatus {
    /// Stored form
    pub fn as_str(self) -> &'static str {
        match self {
            PurgeJobStatus::Running => "RUNNING",
            PurgeJobStatus::Completed => "COMPLETED",
            PurgeJobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PurgeJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurgeJobStatus {
    type Err = SmithyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(PurgeJobStatus::Running),
            "COMPLETED" => Ok(PurgeJobStatus::Completed),
            "FAILED" => Ok(PurgeJobStatus::Failed),
            other => Err(SmithyError::config(format!("unknown purge job status '{}'", other))),
        }
    }
}

/// Record of one purge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeJob {
    pub id: String,
    pub queue: QueueParams,
    pub status: PurgeJobStatus,
    pub created_at: u64,
    /// Last sign of life (ms)
    pub updated_at: u64,
    /// Messages deleted so far
    pub deleted: u64,
    pub error: Option<String>,
}

impl PurgeJob {
    /// A new running job
    pub fn new(queue: QueueParams) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue,
            status: PurgeJobStatus::Running,
            created_at: now,
            updated_at: now,
            deleted: 0,
            error: None,
        }
    }

    fn to_hash_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (fields::ID, self.id.clone()),
            (fields::QUEUE, self.queue.to_string()),
            (fields::STATUS, self.status.to_string()),
            (fields::CREATED_AT, self.created_at.to_string()),
            (fields::UPDATED_AT, self.updated_at.to_string()),
            (fields::DELETED, self.deleted.to_string()),
            (fields::ERROR, self.error.clone().unwrap_or_default()),
        ]
    }

    /// Decode a job hash; `None` when the hash is empty
    pub fn from_hash(hash: &HashMap<String, String>) -> SmithyResult<Option<Self>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| hash.get(name).map(String::as_str).unwrap_or_default();
        let number = |name: &str| get(name).parse::<u64>().unwrap_or(0);

        Ok(Some(Self {
            id: get(fields::ID).to_string(),
            queue: get(fields::QUEUE).parse()?,
            status: get(fields::STATUS).parse()?,
            created_at: number(fields::CREATED_AT),
            updated_at: number(fields::UPDATED_AT),
            deleted: number(fields::DELETED),
            error: Some(get(fields::ERROR).to_string()).filter(|e| !e.is_empty()),
        }))
    }

    /// Whether a lock held by this job has no live owner anymore
    pub fn is_orphaned(&self, now: u64, stale_ms: u64) -> bool {
        self.status != PurgeJobStatus::Running || now.saturating_sub(self.updated_at) > stale_ms
    }
}

/// Runs purge jobs
#[derive(Clone)]
pub struct QueuePurger {
    storage: MessageStorage,
    state: QueueStateManager,
    config: QueueStateConfig,
}

impl QueuePurger {
    /// Create a purger
    pub fn new(storage: MessageStorage, state: QueueStateManager, config: QueueStateConfig) -> Self {
        Self {
            storage,
            state,
            config,
        }
    }

    /// A purge job record
    pub async fn get_job(&self, job_id: &str) -> SmithyResult<Option<PurgeJob>> {
        let redis = self.storage.redis();
        let mut conn = redis.connection();
        let hash: HashMap<String, String> = conn.hgetall(redis.keys().purge_job(job_id)).await?;
        PurgeJob::from_hash(&hash)
    }

    async fn save(&self, job: &PurgeJob) -> SmithyResult<()> {
        let redis = self.storage.redis();
        let key = redis.keys().purge_job(&job.id);
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&key, &job.to_hash_fields()).ignore();
        if job.status != PurgeJobStatus::Running {
            pipe.pexpire(&key, FINISHED_JOB_TTL_MS).ignore();
        }
        let mut conn = redis.connection();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Delete every message of a queue that is not held by a consumer.
    ///
    /// The queue is LOCKED for the duration of the purge; purging a queue
    /// that is already locked fails with `InvalidStateTransition`.
    pub async fn purge_queue(&self, queue: &QueueParams) -> SmithyResult<PurgeJob> {
        let mut job = PurgeJob::new(queue.clone());
        self.save(&job).await?;

        if let Err(e) = self
            .state
            .lock(queue, QueueLockOwner::PurgeJob, &job.id, StateTransitionReason::Purge)
            .await
        {
            let redis = self.storage.redis();
            let mut conn = redis.connection();
            let _: () = conn.del(redis.keys().purge_job(&job.id)).await?;
            return Err(e);
        }
        tracing::info!(queue = %queue, job_id = %job.id, "🔨 Purge started");

        let outcome = self.delete_all(&mut job).await;
        job.updated_at = now_ms();
        let reason = match &outcome {
            Ok(stats) => {
                job.status = PurgeJobStatus::Completed;
                tracing::info!(
                    queue = %queue,
                    job_id = %job.id,
                    "🔨 Purge completed: {} deleted, {} in process",
                    stats.success,
                    stats.in_process
                );
                StateTransitionReason::Completed
            }
            Err(e) => {
                job.status = PurgeJobStatus::Failed;
                job.error = Some(e.to_string());
                tracing::error!(queue = %queue, job_id = %job.id, "🔨 Purge failed: {}", e);
                StateTransitionReason::Failed
            }
        };

        self.save(&job).await?;
        self.state
            .unlock(
                queue,
                QueueLockOwner::PurgeJob,
                &job.id,
                reason,
                StateTransitionOptions::default(),
            )
            .await?;

        outcome.map(|_| job)
    }

    async fn delete_all(&self, job: &mut PurgeJob) -> SmithyResult<DeleteMessagesStats> {
        let redis = self.storage.redis().clone();
        let keys = redis.keys().queue(&job.queue);
        let batch_size = self.config.purge_batch_size.max(1);
        let mut conn = redis.connection();
        let mut total = DeleteMessagesStats::default();
        let mut cursor: u64 = 0;

        loop {
            let (next, ids): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(keys.messages())
                .arg(cursor)
                .arg("COUNT")
                .arg(batch_size)
                .query_async(&mut conn)
                .await?;

            for chunk in ids.chunks(batch_size.min(crate::storage::DELETE_BATCH_SIZE)) {
                let mut pipe = redis::pipe();
                for id in chunk {
                    pipe.hget(redis.keys().message(id), message_fields::CONSUMER_GROUP_ID);
                }
                let groups: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
                let batch: Vec<(MessageId, Option<String>)> = chunk
                    .iter()
                    .zip(groups)
                    .map(|(id, group)| {
                        (MessageId::from(id.as_str()), group.filter(|g| !g.is_empty()))
                    })
                    .collect();

                let stats = self.storage.delete_messages(&job.queue, &batch).await?;
                total.merge(stats);
                job.deleted = total.success;
                job.updated_at = now_ms();
                self.save(job).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(total)
    }
}
