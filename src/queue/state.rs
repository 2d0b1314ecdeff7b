//! Queue operational state: ACTIVE or LOCKED.
//!
//! A lock marks a queue as busy with a destructive operation (a purge job).
//! LOCKED always carries an owner and a lock id, and only the holder of both
//! may unlock. Every change is a compare-and-swap done by the
//! SET_QUEUE_STATE script, which also appends the transition to a capped
//! history list.

use crate::config::QueueStateConfig;
use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use crate::keys::QueueKeys;
use crate::queue::{QueueParams, fields};
use crate::redis_client::scripts::reply_ok;
use crate::redis_client::{RedisClient, ScriptCall, ScriptName};
use crate::utils::now_ms;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operational state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOperationalState {
    /// Normal operation
    Active,
    /// Held by a lock owner
    Locked,
}

impl QueueOperationalState {
    /// Stored form
    pub fn as_str(self) -> &'static str {
        match self {
            QueueOperationalState::Active => "ACTIVE",
            QueueOperationalState::Locked => "LOCKED",
        }
    }
}

impl fmt::Display for QueueOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOperationalState {
    type Err = SmithyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" | "" => Ok(QueueOperationalState::Active),
            "LOCKED" => Ok(QueueOperationalState::Locked),
            other => Err(SmithyError::InvalidStateTransition {
                message: format!("unknown operational state '{}'", other),
            }),
        }
    }
}

/// Who holds a queue lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueLockOwner {
    /// A queue purge job; the lock id is the job id
    PurgeJob,
}

impl QueueLockOwner {
    /// Stored form
    pub fn as_str(self) -> &'static str {
        match self {
            QueueLockOwner::PurgeJob => "PURGE_JOB",
        }
    }
}

impl fmt::Display for QueueLockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueLockOwner {
    type Err = SmithyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PURGE_JOB" => Ok(QueueLockOwner::PurgeJob),
            other => Err(SmithyError::InvalidStateTransition {
                message: format!("unknown lock owner '{}'", other),
            }),
        }
    }
}

/// Why the state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateTransitionReason {
    /// Initial state of a new queue
    Created,
    /// Locked for a purge
    Purge,
    /// Released after the lock holder finished
    Completed,
    /// Released after the lock holder failed
    Failed,
    /// Released by the orphaned lock recovery
    OrphanedLockRecovery,
    /// Operator action
    Manual,
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateTransition {
    pub from: QueueOperationalState,
    pub to: QueueOperationalState,
    pub reason: StateTransitionReason,
    /// When the change happened (ms)
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<QueueLockOwner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Optional details of a transition
#[derive(Debug, Clone, Default)]
pub struct StateTransitionOptions {
    /// Required when locking
    pub lock_owner: Option<QueueLockOwner>,
    /// Generated when locking without one
    pub lock_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl StateTransitionOptions {
    /// Options for a lock held by `owner`
    pub fn locked_by(owner: QueueLockOwner, lock_id: impl Into<String>) -> Self {
        Self {
            lock_owner: Some(owner),
            lock_id: Some(lock_id.into()),
            ..Default::default()
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Check a requested edge against the allow-list.
///
/// ACTIVE -> LOCKED needs an owner. LOCKED -> ACTIVE only happens through an
/// unlock, never through a plain transition. Anything else is rejected.
pub fn validate_transition(
    from: QueueOperationalState,
    to: QueueOperationalState,
    options: &StateTransitionOptions,
) -> SmithyResult<()> {
    use QueueOperationalState::*;
    match (from, to) {
        (Active, Locked) if options.lock_owner.is_some() => Ok(()),
        (Active, Locked) => Err(SmithyError::InvalidStateTransition {
            message: "a lock owner is required to lock a queue".to_string(),
        }),
        (Locked, Active) => Err(SmithyError::InvalidStateTransition {
            message: "a locked queue can only be released by unlocking it".to_string(),
        }),
        (from, to) => Err(SmithyError::InvalidStateTransition {
            message: format!("{} -> {} is not allowed", from, to),
        }),
    }
}

/// Append the writes releasing a lock to `pipe`.
///
/// Used by callers that release a lock inside their own WATCH transaction.
pub(crate) fn append_release(
    pipe: &mut redis::Pipeline,
    keys: &QueueKeys,
    transition: &QueueStateTransition,
    history_size: usize,
) -> SmithyResult<()> {
    let json = serde_json::to_string(transition)?;
    pipe.hdel(keys.properties(), &[fields::LOCK_ID, fields::LOCK_OWNER])
        .ignore()
        .hset_multiple(
            keys.properties(),
            &[
                (fields::OPERATIONAL_STATE, transition.to.as_str().to_string()),
                (fields::LAST_STATE_CHANGE_AT, transition.timestamp.to_string()),
                (fields::STATE_TRANSITION, json.clone()),
            ],
        )
        .ignore()
        .lpush(keys.state_history(), json)
        .ignore()
        .ltrim(keys.state_history(), 0, history_size as isize - 1)
        .ignore();
    Ok(())
}

/// Reads and changes the operational state of queues
#[derive(Clone)]
pub struct QueueStateManager {
    redis: RedisClient,
    config: QueueStateConfig,
    events: SharedEventBus,
}

impl QueueStateManager {
    /// Create a state manager
    pub fn new(redis: RedisClient, config: QueueStateConfig, events: SharedEventBus) -> Self {
        Self {
            redis,
            config,
            events,
        }
    }

    /// Current state, as the last recorded transition
    pub async fn get_state(&self, queue: &QueueParams) -> SmithyResult<QueueStateTransition> {
        let keys = self.redis.keys().queue(queue);
        let mut conn = self.redis.connection();
        let (state, transition, created_at): (Option<String>, Option<String>, Option<u64>) = conn
            .hget(
                keys.properties(),
                &[
                    fields::OPERATIONAL_STATE,
                    fields::STATE_TRANSITION,
                    fields::CREATED_AT,
                ],
            )
            .await?;

        let Some(state) = state else {
            return Err(SmithyError::QueueNotFound {
                queue: queue.to_string(),
            });
        };
        match transition.filter(|t| !t.is_empty()) {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => {
                let state: QueueOperationalState = state.parse()?;
                Ok(QueueStateTransition {
                    from: state,
                    to: state,
                    reason: StateTransitionReason::Created,
                    timestamp: created_at.unwrap_or(0),
                    lock_owner: None,
                    lock_id: None,
                    description: None,
                    metadata: None,
                })
            }
        }
    }

    /// Latest transitions, newest first
    pub async fn get_history(
        &self,
        queue: &QueueParams,
        limit: usize,
    ) -> SmithyResult<Vec<QueueStateTransition>> {
        let keys = self.redis.keys().queue(queue);
        let mut conn = self.redis.connection();
        let stop = limit.min(self.config.history_size).max(1) as isize - 1;
        let entries: Vec<String> = conn.lrange(keys.state_history(), 0, stop).await?;
        entries
            .iter()
            .map(|json| serde_json::from_str(json).map_err(SmithyError::from))
            .collect()
    }

    /// Whether the queue is LOCKED
    pub async fn is_locked(&self, queue: &QueueParams) -> SmithyResult<bool> {
        Ok(self.get_state(queue).await?.to == QueueOperationalState::Locked)
    }

    /// Move the queue to `to`
    pub async fn transition_to(
        &self,
        queue: &QueueParams,
        to: QueueOperationalState,
        reason: StateTransitionReason,
        options: StateTransitionOptions,
    ) -> SmithyResult<QueueStateTransition> {
        let current = self.get_state(queue).await?;
        validate_transition(current.to, to, &options)?;

        let lock_id = match to {
            QueueOperationalState::Locked => Some(
                options
                    .lock_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            QueueOperationalState::Active => None,
        };
        let transition = QueueStateTransition {
            from: current.to,
            to,
            reason,
            timestamp: now_ms(),
            lock_owner: options.lock_owner,
            lock_id,
            description: options.description,
            metadata: options.metadata,
        };
        self.apply(queue, "lock", &transition).await?;
        Ok(transition)
    }

    /// Lock the queue for `owner`
    pub async fn lock(
        &self,
        queue: &QueueParams,
        owner: QueueLockOwner,
        lock_id: impl Into<String>,
        reason: StateTransitionReason,
    ) -> SmithyResult<QueueStateTransition> {
        self.transition_to(
            queue,
            QueueOperationalState::Locked,
            reason,
            StateTransitionOptions::locked_by(owner, lock_id),
        )
        .await
    }

    /// Release a lock held by `owner` under `lock_id`
    pub async fn unlock(
        &self,
        queue: &QueueParams,
        owner: QueueLockOwner,
        lock_id: &str,
        reason: StateTransitionReason,
        options: StateTransitionOptions,
    ) -> SmithyResult<QueueStateTransition> {
        let current = self.get_state(queue).await?;
        if current.to != QueueOperationalState::Locked {
            return Err(SmithyError::InvalidStateTransition {
                message: format!("queue '{}' is not locked", queue),
            });
        }

        let transition = QueueStateTransition {
            from: QueueOperationalState::Locked,
            to: QueueOperationalState::Active,
            reason,
            timestamp: now_ms(),
            lock_owner: Some(owner),
            lock_id: Some(lock_id.to_string()),
            description: options.description,
            metadata: options.metadata,
        };
        self.apply(queue, "unlock", &transition).await?;
        Ok(transition)
    }

    async fn apply(
        &self,
        queue: &QueueParams,
        operation: &str,
        transition: &QueueStateTransition,
    ) -> SmithyResult<()> {
        let keys = self.redis.keys().queue(queue);
        let call = ScriptCall::new(queue.to_string())
            .key(keys.properties())
            .key(keys.state_history())
            .arg(operation)
            .arg(transition.from)
            .arg(transition.to)
            .arg(transition.lock_id.clone().unwrap_or_default())
            .arg(
                transition
                    .lock_owner
                    .map(|o| o.as_str())
                    .unwrap_or_default(),
            )
            .arg(serde_json::to_string(transition)?)
            .arg(self.config.history_size)
            .arg(transition.timestamp);

        let reply = self.redis.run_script(ScriptName::SetQueueState, call).await?;
        reply_ok(ScriptName::SetQueueState, &reply)?;

        tracing::info!(
            queue = %queue,
            "🔨 Queue state {} -> {} ({:?})",
            transition.from,
            transition.to,
            transition.reason
        );
        self.events.emit(SmithyEvent::QueueStateChanged {
            queue: queue.clone(),
            from: transition.from,
            to: transition.to,
        });
        Ok(())
    }
}
