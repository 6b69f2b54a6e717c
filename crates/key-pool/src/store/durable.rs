//! Redis-backed durable store
//!
//! Counters survive process restarts and are shared by every gateway replica
//! pointed at the same database. Increments use `INCRBY` and the daily
//! rollover runs as one Lua script, so concurrent writers never lose updates.
//! Every command is bounded by the configured timeout; failures are logged and
//! mapped to the store's safe defaults.

use std::time::Duration;

use common::Secret;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo};
use tracing::{debug, info, warn};

use super::{Backend, Rollover, StateStore, StoreFuture};
use crate::error::StoreError;

/// Connection parameters for the durable store.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<Secret<String>>,
    /// Startup connection attempts before falling back to memory
    pub connect_attempts: u32,
    /// Fixed pause between startup attempts
    pub connect_delay: Duration,
    /// Bound on connect and on every command round-trip
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "redis".into(),
            port: 6379,
            db: 0,
            password: None,
            connect_attempts: 15,
            connect_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RedisSettings {
    /// Connection parameters, including the password when set. Never log this.
    pub fn connection_info(&self) -> ConnectionInfo {
        let password = self
            .password
            .as_ref()
            .filter(|p| !p.is_blank())
            .map(|p| p.expose().clone());
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password,
                ..RedisConnectionInfo::default()
            },
        }
    }

    /// Host, port and database for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }
}

/// KEYS[1] is the date key, KEYS[2..] the counters, ARGV[1] today's date.
/// Replies `{0, date}` when already current, `{1, previous}` after a reset.
const ROLLOVER_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[1])
if previous == ARGV[1] then
  return {0, previous}
end
for i = 2, #KEYS do
  redis.call('SET', KEYS[i], '0')
end
redis.call('SET', KEYS[1], ARGV[1])
return {1, previous}
"#;

/// Durable store over a multiplexed async Redis connection.
pub struct RedisStore {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl RedisStore {
    /// Open a connection and verify it with `PING`.
    ///
    /// Both the connect and the ping are bounded by `settings.timeout`.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.connection_info())?;
        let mut conn = tokio::time::timeout(
            settings.timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(settings.timeout))??;

        let pong = tokio::time::timeout(
            settings.timeout,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout(settings.timeout))??;
        debug!(reply = %pong, "redis ping ok");
        info!(endpoint = %settings.endpoint(), "connected to redis");

        Ok(Self {
            conn,
            timeout: settings.timeout,
        })
    }

    /// Run one command with the per-command timeout, absorbing failures.
    async fn run<T: FromRedisValue>(&self, op: &'static str, key: &str, cmd: redis::Cmd) -> Option<T> {
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, key, error = %e, "redis command failed");
                None
            }
            Err(_) => {
                warn!(
                    op,
                    key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "redis command timed out"
                );
                None
            }
        }
    }
}

impl StateStore for RedisStore {
    fn backend(&self) -> Backend {
        Backend::Redis
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            self.run::<Option<String>>("get", key, cmd).await.flatten()
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            self.run::<()>("set", key, cmd).await.is_some()
        })
    }

    fn increment<'a>(&'a self, key: &'a str, by: i64) -> StoreFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("INCRBY");
            cmd.arg(key).arg(by);
            self.run::<i64>("incrby", key, cmd).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut cmd = redis::cmd("EXISTS");
            cmd.arg(key);
            self.run::<bool>("exists", key, cmd).await.unwrap_or(false)
        })
    }

    fn rollover<'a>(
        &'a self,
        date_key: &'a str,
        date: &'a str,
        counters: &'a [String],
    ) -> StoreFuture<'a, Rollover> {
        Box::pin(async move {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(ROLLOVER_SCRIPT)
                .arg(1 + counters.len())
                .arg(date_key)
                .arg(counters)
                .arg(date);
            match self
                .run::<(i64, Option<String>)>("rollover", date_key, cmd)
                .await
            {
                Some((0, _)) => Rollover::Current,
                Some((_, previous)) => Rollover::Reset { previous },
                None => Rollover::Unavailable,
            }
        })
    }
}
