//! Redis backend for the Edgeguard key-value store.
//!
//! Holds rate-limit counters and cache entries on a pooled Redis
//! connection. Counters are bumped with an atomic `INCR` + `PEXPIRE`
//! pipeline; cache entries are written without a Redis TTL since the cache
//! layer judges freshness itself.
//!
//! Connection and I/O failures surface as [`KvError::Unavailable`], which the
//! rate limiter treats as fail-open and the cache layer as a store outage.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolError};
use redis::{AsyncCommands, RedisError};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use edgeguard_auth::storage::{KvError, KvStore};

/// Keys requested per `SCAN` round trip during prefix deletion.
const SCAN_COUNT: usize = 500;

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL (e.g. "redis://localhost:6379").
    pub url: String,

    /// Maximum pooled connections.
    pub pool_size: usize,

    /// Wait, create and recycle timeout for pooled connections.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            timeout: Duration::from_secs(2),
        }
    }
}

/// [`KvStore`] on a deadpool-managed Redis pool.
#[derive(Clone)]
pub struct RedisKvStore {
    pool: Pool,
}

impl RedisKvStore {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Builds a pool from `config`.
    ///
    /// No connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Unavailable` if the pool cannot be created, e.g. for
    /// a malformed URL.
    pub fn connect(config: &RedisConfig) -> Result<Self, KvError> {
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.timeout);
        pool_config.timeouts.create = Some(config.timeout);
        pool_config.timeouts.recycle = Some(config.timeout);

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| KvError::Unavailable(format!("failed to create Redis pool: {e}")))?;

        tracing::info!(pool_size = config.pool_size, "Redis pool created");
        Ok(Self::new(pool))
    }

    /// Round-trips a `PING`.
    ///
    /// # Errors
    ///
    /// Returns a `KvError` if Redis cannot be reached.
    pub async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn conn(&self) -> Result<Connection, KvError> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Redis GET error");
            map_redis_error(e)
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            }
            None => conn.set(key, value).await,
        };
        result.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Redis SET error");
            map_redis_error(e)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Redis DEL error");
            map_redis_error(e)
        })?;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            if !keys.is_empty() {
                let count: u64 = conn.del(keys).await.map_err(map_redis_error)?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "Redis INCR error");
                map_redis_error(e)
            })?;
        Ok(count)
    }
}

/// Whole milliseconds, at least one so the key always expires.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escapes glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_pool_error(err: PoolError) -> KvError {
    KvError::Unavailable(format!("Failed to get Redis connection: {err}"))
}

fn map_redis_error(err: RedisError) -> KvError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        KvError::Unavailable(err.to_string())
    } else {
        KvError::Operation(err.to_string())
    }
}
