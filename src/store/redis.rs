//! Redis-backed counter store.
//!
//! Each trait method is sent as one MULTI/EXEC pipeline over an
//! auto-reconnecting connection manager, so a call costs a single round trip.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Pipeline, RedisError};
use tracing::{debug, info};

use super::{ttl_secs, CounterStore, StoreError, WindowSnapshot};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// A counter store living in Redis (or any server speaking its protocol).
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        info!(url = %url, "Connecting to counter store");

        let client = redis::Client::open(url)?;
        let manager = with_timeout(command_timeout, ConnectionManager::new(client)).await?;

        info!("Counter store connected");
        Ok(Self {
            manager,
            command_timeout,
        })
    }

    async fn run<T>(&self, pipe: &Pipeline) -> Result<T, StoreError>
    where
        T: redis::FromRedisValue,
    {
        let mut conn = self.manager.clone();
        with_timeout(self.command_timeout, pipe.query_async(&mut conn)).await
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Unavailable(format!(
            "no reply within {}ms",
            limit.as_millis()
        ))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn trim_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<WindowSnapshot, StoreError> {
        let (count, oldest): (u64, Vec<(String, f64)>) =
            self.run(&trim_pipeline(key, window_start_ms)).await?;
        let snapshot = window_snapshot(count, oldest);

        debug!(key = %key, count, oldest_ms = ?snapshot.oldest_ms, "Trimmed window");
        Ok(snapshot)
    }

    async fn add_entry(
        &self,
        key: &str,
        score_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let () = self
            .run(&add_entry_pipeline(key, score_ms, member, ttl))
            .await?;
        Ok(())
    }

    async fn increment_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError> {
        self.run(&step_pipeline("INCR", keys, ttl)).await
    }

    async fn decrement_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError> {
        self.run(&step_pipeline("DECR", keys, ttl)).await
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.cmd("MGET").arg(keys);

        let (values,): (Vec<Option<i64>>,) = self.run(&pipe).await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(key).ignore();

        let () = self.run(&pipe).await?;
        Ok(())
    }
}

/// Purge entries older than `window_start_ms` (exclusive), then read the
/// cardinality and the oldest surviving entry with its score.
fn trim_pipeline(key: &str, window_start_ms: i64) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("ZREMRANGEBYSCORE")
        .arg(key)
        .arg("-inf")
        .arg(format!("({window_start_ms}"))
        .ignore()
        .cmd("ZCARD")
        .arg(key)
        .cmd("ZRANGE")
        .arg(key)
        .arg(0)
        .arg(0)
        .arg("WITHSCORES");
    pipe
}

fn window_snapshot(count: u64, oldest: Vec<(String, f64)>) -> WindowSnapshot {
    WindowSnapshot {
        count,
        oldest_ms: oldest.first().map(|(_, score)| *score as i64),
    }
}

fn add_entry_pipeline(key: &str, score_ms: i64, member: &str, ttl: Duration) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("ZADD")
        .arg(key)
        .arg(score_ms)
        .arg(member)
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl_secs(ttl))
        .ignore();
    pipe
}

/// `INCR`/`DECR` each key followed by an `EXPIRE`, keeping only the counter
/// replies.
fn step_pipeline(command: &str, keys: &[String], ttl: Duration) -> Pipeline {
    let ttl = ttl_secs(ttl);
    let mut pipe = redis::pipe();
    pipe.atomic();
    for key in keys {
        pipe.cmd(command)
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl)
            .ignore();
    }
    pipe
}
