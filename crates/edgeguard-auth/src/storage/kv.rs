//! Key-value store trait used by the rate limiter and the cache layer.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AuthError;

/// Errors reported by a key-value store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The store could not be reached.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but rejected the command.
    #[error("key-value operation failed: {0}")]
    Operation(String),
}

impl From<KvError> for AuthError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable(message) => AuthError::StoreUnavailable { message },
            KvError::Operation(message) => AuthError::Storage { message },
        }
    }
}

/// A string key-value store with optional per-key expiry.
///
/// Writes are last-writer-wins. No operation is retried by callers.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Stores `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Removes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Removes every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError>;

    /// Atomically increments the integer under `key` (absent counts as 0)
    /// and sets its expiry to `ttl`. Returns the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;
}
