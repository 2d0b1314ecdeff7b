//! Optimistic transactions: WATCH, read and validate, MULTI/EXEC, retry.
//!
//! Used where a read-validate-write can't be a single script. An attempt
//! reads through the watching connection and returns the writes to commit
//! as a [`PreparedTransaction`]. If EXEC reports that a watched key changed,
//! the whole attempt runs again after a backoff, up to `max_attempts`.
//! UNWATCH is issued on every path that does not end in a committed EXEC.

use crate::config::WatchConfig;
use crate::error::{SmithyError, SmithyResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Cmd, FromRedisValue, Pipeline, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Post-commit hook receiving the EXEC results
pub type AfterExec = Box<dyn FnOnce(&[Value]) -> SmithyResult<()> + Send>;

/// Connection able to run a WATCH transaction
#[async_trait]
pub trait WatchConnection: Send {
    /// WATCH the given keys
    async fn watch(&mut self, keys: &[String]) -> SmithyResult<()>;

    /// Drop all watches of the connection
    async fn unwatch(&mut self) -> SmithyResult<()>;

    /// Run a read command
    async fn query(&mut self, cmd: &Cmd) -> SmithyResult<Value>;

    /// Run an atomic pipeline; `None` when a watched key changed
    async fn exec(&mut self, pipeline: &Pipeline) -> SmithyResult<Option<Vec<Value>>>;
}

macro_rules! impl_watch_connection {
    ($conn:ty) => {
        #[async_trait]
        impl WatchConnection for $conn {
            async fn watch(&mut self, keys: &[String]) -> SmithyResult<()> {
                redis::cmd("WATCH")
                    .arg(keys)
                    .query_async::<()>(self)
                    .await?;
                Ok(())
            }

            async fn unwatch(&mut self) -> SmithyResult<()> {
                redis::cmd("UNWATCH").query_async::<()>(self).await?;
                Ok(())
            }

            async fn query(&mut self, cmd: &Cmd) -> SmithyResult<Value> {
                Ok(cmd.query_async::<Value>(self).await?)
            }

            async fn exec(&mut self, pipeline: &Pipeline) -> SmithyResult<Option<Vec<Value>>> {
                Ok(pipeline.query_async::<Option<Vec<Value>>>(self).await?)
            }
        }
    };
}

impl_watch_connection!(MultiplexedConnection);
impl_watch_connection!(ConnectionManager);

/// Run a read command and decode the reply
pub async fn query_as<T: FromRedisValue>(
    conn: &mut dyn WatchConnection,
    cmd: &Cmd,
) -> SmithyResult<T> {
    let reply = conn.query(cmd).await?;
    Ok(T::from_redis_value(&reply)?)
}

/// Outcome of a successful attempt: what to commit and what to return.
pub struct PreparedTransaction<T> {
    pipeline: Option<Pipeline>,
    output: T,
    after_exec: Option<AfterExec>,
}

impl<T> PreparedTransaction<T> {
    /// Commit the pipeline. It is made atomic (MULTI/EXEC).
    pub fn commit(mut pipeline: Pipeline, output: T) -> Self {
        pipeline.atomic();
        Self {
            pipeline: Some(pipeline),
            output,
            after_exec: None,
        }
    }

    /// Nothing to write; the watches are released and `output` returned
    pub fn skip(output: T) -> Self {
        Self {
            pipeline: None,
            output,
            after_exec: None,
        }
    }

    /// Run `hook` with the EXEC results once the pipeline committed
    pub fn after_exec(
        mut self,
        hook: impl FnOnce(&[Value]) -> SmithyResult<()> + Send + 'static,
    ) -> Self {
        self.after_exec = Some(Box::new(hook));
        self
    }
}

/// One read-validate-prepare pass of a WATCH transaction
#[async_trait]
pub trait WatchAttempt: Send + Sync {
    /// Value returned once the transaction committed
    type Output: Send;

    /// Keys to WATCH before each attempt
    fn watched_keys(&self) -> Vec<String>;

    /// Read and validate through `conn`, then prepare the writes
    async fn attempt(
        &self,
        conn: &mut dyn WatchConnection,
    ) -> SmithyResult<PreparedTransaction<Self::Output>>;
}

/// Retry settings of a WATCH transaction
#[derive(Clone)]
pub struct WatchOptions {
    /// Attempts before giving up with `WatchRetriesExceeded`
    pub max_attempts: u32,
    backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    on_retry: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("max_attempts", &self.max_attempts)
            .field("on_retry", &self.on_retry.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

impl WatchOptions {
    /// Options with a linear `attempt * backoff_base_ms` backoff
    pub fn from_config(config: &WatchConfig) -> Self {
        let base = config.backoff_base_ms;
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Arc::new(move |attempt| {
                Duration::from_millis(crate::utils::linear_backoff(attempt, base))
            }),
            on_retry: None,
        }
    }

    /// Replace the backoff function
    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Call `on_retry(attempt)` every time an attempt is retried
    pub fn with_on_retry(mut self, on_retry: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    /// Set the attempt limit
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

async fn release(conn: &mut dyn WatchConnection) {
    if let Err(e) = conn.unwatch().await {
        tracing::warn!("🔨 UNWATCH failed: {}", e);
    }
}

/// Run `attempt` as an optimistic transaction on `conn`.
///
/// A failing `after_exec` hook is logged and does not fail the call: the
/// writes are already committed at that point.
pub async fn run_watch_transaction<A>(
    conn: &mut dyn WatchConnection,
    attempt: &A,
    options: &WatchOptions,
) -> SmithyResult<A::Output>
where
    A: WatchAttempt + ?Sized,
{
    let keys = attempt.watched_keys();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if let Err(e) = conn.watch(&keys).await {
            release(conn).await;
            return Err(e);
        }

        let prepared = match attempt.attempt(conn).await {
            Ok(prepared) => prepared,
            Err(e) => {
                release(conn).await;
                return Err(e);
            }
        };

        let Some(pipeline) = prepared.pipeline else {
            release(conn).await;
            return Ok(prepared.output);
        };

        match conn.exec(&pipeline).await {
            Ok(Some(results)) => {
                if let Some(hook) = prepared.after_exec {
                    if let Err(e) = hook(&results) {
                        tracing::warn!("🔨 Post-commit hook failed: {}", e);
                    }
                }
                return Ok(prepared.output);
            }
            Ok(None) => {
                release(conn).await;
                if attempts >= options.max_attempts {
                    tracing::warn!(
                        "🔨 Transaction on {:?} gave up after {} attempts",
                        keys,
                        attempts
                    );
                    return Err(SmithyError::WatchRetriesExceeded { attempts });
                }
                tracing::debug!("🔨 Watched keys changed, retrying (attempt {})", attempts);
                if let Some(on_retry) = &options.on_retry {
                    on_retry(attempts);
                }
                sleep((options.backoff)(attempts)).await;
            }
            Err(e) => {
                release(conn).await;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory connection: EXEC aborts while `conflicts` is positive
    #[derive(Default)]
    pub(crate) struct FakeConnection {
        pub conflicts: u32,
        pub watches: u32,
        pub unwatches: u32,
        pub commits: u32,
        pub fail_exec: bool,
    }

    #[async_trait]
    impl WatchConnection for FakeConnection {
        async fn watch(&mut self, _keys: &[String]) -> SmithyResult<()> {
            self.watches += 1;
            Ok(())
        }

        async fn unwatch(&mut self) -> SmithyResult<()> {
            self.unwatches += 1;
            Ok(())
        }

        async fn query(&mut self, _cmd: &Cmd) -> SmithyResult<Value> {
            Ok(Value::Int(self.commits as i64))
        }

        async fn exec(&mut self, _pipeline: &Pipeline) -> SmithyResult<Option<Vec<Value>>> {
            if self.fail_exec {
                return Err(SmithyError::NotRunning);
            }
            if self.conflicts > 0 {
                self.conflicts -= 1;
                return Ok(None);
            }
            self.commits += 1;
            Ok(Some(vec![Value::Okay]))
        }
    }

    struct Increment {
        reject: bool,
        nothing_to_do: bool,
        hook_fails: bool,
    }

    impl Increment {
        fn new() -> Self {
            Self {
                reject: false,
                nothing_to_do: false,
                hook_fails: false,
            }
        }
    }

    #[async_trait]
    impl WatchAttempt for Increment {
        type Output = i64;

        fn watched_keys(&self) -> Vec<String> {
            vec!["counter".to_string()]
        }

        async fn attempt(
            &self,
            conn: &mut dyn WatchConnection,
        ) -> SmithyResult<PreparedTransaction<i64>> {
            let current: i64 = query_as(conn, &redis::cmd("GET")).await?;
            if self.reject {
                return Err(SmithyError::invalid_message("rejected"));
            }
            if self.nothing_to_do {
                return Ok(PreparedTransaction::skip(current));
            }
            let mut pipe = redis::pipe();
            pipe.cmd("SET").arg("counter").arg(current + 1);
            let fails = self.hook_fails;
            Ok(PreparedTransaction::commit(pipe, current + 1).after_exec(move |results| {
                assert_eq!(results.len(), 1);
                if fails {
                    Err(SmithyError::config("hook"))
                } else {
                    Ok(())
                }
            }))
        }
    }

    fn fast_options() -> WatchOptions {
        WatchOptions::default().with_backoff(|_| Duration::ZERO)
    }

    #[tokio::test]
    async fn test_commits_first_time() {
        let mut conn = FakeConnection::default();
        let out = run_watch_transaction(&mut conn, &Increment::new(), &fast_options())
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(conn.commits, 1);
        assert_eq!(conn.unwatches, 0);
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let retries = Arc::new(AtomicU32::new(0));
        let seen = retries.clone();
        let options = fast_options().with_on_retry(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut conn = FakeConnection {
            conflicts: 1,
            ..Default::default()
        };
        let out = run_watch_transaction(&mut conn, &Increment::new(), &options)
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert_eq!(conn.watches, 2);
        assert_eq!(conn.commits, 1);
    }

    #[tokio::test]
    async fn test_gives_up_without_writing() {
        let retries = Arc::new(AtomicU32::new(0));
        let seen = retries.clone();
        let options = fast_options().with_on_retry(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut conn = FakeConnection {
            conflicts: 10,
            ..Default::default()
        };
        let err = run_watch_transaction(&mut conn, &Increment::new(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SmithyError::WatchRetriesExceeded { attempts: 3 }));
        assert_eq!(conn.commits, 0);
        assert_eq!(conn.unwatches, 3);
        // no retry callback after the last attempt
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_error_unwatches() {
        let mut conn = FakeConnection::default();
        let attempt = Increment {
            reject: true,
            ..Increment::new()
        };
        let err = run_watch_transaction(&mut conn, &attempt, &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, SmithyError::InvalidMessage { .. }));
        assert_eq!(conn.unwatches, 1);
        assert_eq!(conn.commits, 0);
    }

    #[tokio::test]
    async fn test_exec_error_unwatches() {
        let mut conn = FakeConnection {
            fail_exec: true,
            ..Default::default()
        };
        assert!(
            run_watch_transaction(&mut conn, &Increment::new(), &fast_options())
                .await
                .is_err()
        );
        assert_eq!(conn.unwatches, 1);
    }

    #[tokio::test]
    async fn test_skip_releases_watch() {
        let mut conn = FakeConnection::default();
        let attempt = Increment {
            nothing_to_do: true,
            ..Increment::new()
        };
        let out = run_watch_transaction(&mut conn, &attempt, &fast_options())
            .await
            .unwrap();
        assert_eq!(out, 0);
        assert_eq!(conn.unwatches, 1);
        assert_eq!(conn.commits, 0);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_fail_the_commit() {
        let mut conn = FakeConnection::default();
        let attempt = Increment {
            hook_fails: true,
            ..Increment::new()
        };
        let out = run_watch_transaction(&mut conn, &attempt, &fast_options())
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(conn.commits, 1);
    }
}
