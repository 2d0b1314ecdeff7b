//! Redis access for SmithyMQ.
//!
//! [`RedisClient`] wraps a [`redis::Client`] together with a shared
//! [`ConnectionManager`] for short-lived commands, the compiled script
//! catalogue and the key schema. Background workers and WATCH transactions
//! get connections of their own: WATCH state belongs to a connection, so it
//! must never be shared with unrelated commands.

use crate::config::{DurationExt, RedisConfig};
use crate::error::{SmithyError, SmithyResult};
use crate::keys::RedisKeys;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, FromRedisValue, Value};
use std::sync::Arc;
use tokio::time::timeout;

pub mod scripts;
pub mod watch;

pub use scripts::{ScriptCall, ScriptName, ScriptRegistry};
pub use watch::{
    PreparedTransaction, WatchAttempt, WatchConnection, WatchOptions, run_watch_transaction,
};

/// Shared Redis handle: connection pool, scripts and key schema.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: ConnectionManager,
    scripts: Arc<ScriptRegistry>,
    keys: RedisKeys,
    config: RedisConfig,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("config", &self.config)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl RedisClient {
    /// Connect to Redis
    pub async fn connect(config: &RedisConfig) -> SmithyResult<Self> {
        let client = Client::open(config.connection_string.as_str())?;
        let connect_timeout = config.connect_timeout_secs.secs();

        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| SmithyError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })??;

        tracing::debug!(prefix = %config.key_prefix, "🔨 Connected to Redis");

        Ok(Self {
            client,
            conn,
            scripts: Arc::new(ScriptRegistry::new()),
            keys: RedisKeys::new(config.key_prefix.clone()),
            config: config.clone(),
        })
    }

    /// A separate client with its own connection, for a background worker
    pub async fn dedicated(&self) -> SmithyResult<Self> {
        Self::connect(&self.config).await
    }

    /// A fresh multiplexed connection for one WATCH transaction
    pub async fn watch_connection(&self) -> SmithyResult<MultiplexedConnection> {
        let connect_timeout = self.config.connect_timeout_secs.secs();
        let conn = timeout(connect_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| SmithyError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })??;
        Ok(conn)
    }

    /// Shared connection for plain commands
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Key schema
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Connection settings
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Run a script and map symbolic error replies to typed errors
    pub async fn run_script(&self, name: ScriptName, call: ScriptCall) -> SmithyResult<Value> {
        let script = self.scripts.get(name)?;
        let mut invocation = script.prepare_invoke();
        for key in &call.keys {
            invocation.key(key);
        }
        for arg in &call.args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let reply: Value = invocation.invoke_async(&mut conn).await?;
        tracing::trace!(script = %name, "script replied {:?}", reply);
        call.check_reply(reply)
    }

    /// Run a script and decode its reply
    pub async fn run_script_as<T: FromRedisValue>(
        &self,
        name: ScriptName,
        call: ScriptCall,
    ) -> SmithyResult<T> {
        let reply = self.run_script(name, call).await?;
        T::from_redis_value(&reply).map_err(|_| SmithyError::unexpected_reply(name.as_str(), &reply))
    }

    /// Check the server answers
    pub async fn ping(&self) -> SmithyResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(SmithyError::unexpected_reply("PING", pong))
        }
    }
}
