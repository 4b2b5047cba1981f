//! Cache-aside helper over the key-value store.
//!
//! Entries are stored as JSON `{"value": .., "writtenAt": <unix ms>}` with no
//! store-native expiry. Freshness is decided at read time by comparing the
//! entry's age against the configured TTL, so a stale entry lingers until
//! the next read of its key removes it.
//!
//! There is no negative caching: a miss always runs the loader, and a loader
//! error is returned without writing anything. Callers must fold every query
//! parameter into the key so distinct queries never share an entry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::AuthResult;
use crate::clock::{Clock, unix_millis};
use crate::config::CacheConfig;
use crate::error::AuthError;
use crate::storage::KvStore;

/// Cache key helpers.
pub struct CacheKey;

impl CacheKey {
    /// Prefix shared by every account list/count entry.
    pub const ACCOUNT_LIST_PREFIX: &'static str = "accounts:";

    /// Point entry for one account record.
    #[must_use]
    pub fn account(id: &str) -> String {
        format!("account:{id}")
    }

    /// List or count entry under [`ACCOUNT_LIST_PREFIX`](Self::ACCOUNT_LIST_PREFIX).
    ///
    /// Parameters are sorted so the same query always maps to the same key.
    #[must_use]
    pub fn account_list(params: &[(&str, &str)]) -> String {
        let mut params = params.to_vec();
        params.sort_unstable();
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}{query}", Self::ACCOUNT_LIST_PREFIX)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry<T> {
    value: T,
    written_at: i64,
}

/// Outcome of reading a key.
enum Lookup<T> {
    Fresh(T),
    Stale,
    Missing,
}

/// Read-through cache with timestamp freshness.
pub struct CacheLayer {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    enabled: bool,
}

impl CacheLayer {
    /// Creates a cache layer over `kv`.
    pub fn new(kv: Arc<dyn KvStore>, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            ttl: config.ttl,
            enabled: config.enabled,
        }
    }

    /// Returns the cached value for `key`, or runs `loader` and caches its
    /// result.
    ///
    /// A fresh hit (age below the TTL) never invokes `loader`. On a stale
    /// hit the entry is deleted on a best-effort basis before loading. A
    /// loaded value is returned even if writing it back fails.
    ///
    /// # Errors
    ///
    /// Returns the loader's error unchanged, or `AuthError::StoreUnavailable`
    /// if the store cannot be read.
    #[instrument(skip(self, loader))]
    pub async fn try_cache<T, F, Fut>(&self, key: &str, loader: F) -> AuthResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        if !self.enabled {
            return loader().await;
        }

        match self.lookup(key).await? {
            Lookup::Fresh(value) => {
                tracing::debug!("cache hit");
                return Ok(value);
            }
            Lookup::Stale => {
                tracing::debug!("cache stale");
                if let Err(e) = self.kv.delete(key).await {
                    tracing::warn!(error = %e, "Failed to delete stale cache entry");
                }
            }
            Lookup::Missing => tracing::debug!("cache miss"),
        }

        let value = loader().await?;
        if let Err(e) = self.put(key, &value).await {
            tracing::warn!(error = %e, "Failed to populate cache entry");
        }
        Ok(value)
    }

    /// Stores `value` under `key` stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::StoreUnavailable` if the store write fails.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> AuthResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let entry = CacheEntry {
            value,
            written_at: unix_millis(self.clock.now()),
        };
        let encoded = serde_json::to_string(&entry)
            .map_err(|e| AuthError::internal(format!("Failed to encode cache entry: {e}")))?;

        self.kv
            .set(key, &encoded, None)
            .await
            .map_err(|e| AuthError::store_unavailable(format!("cache write for {key}: {e}")))
    }

    /// Removes one entry.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::StoreUnavailable` if the store delete fails.
    pub async fn clear_cache(&self, key: &str) -> AuthResult<()> {
        self.kv
            .delete(key)
            .await
            .map(|_| ())
            .map_err(|e| AuthError::store_unavailable(format!("cache delete for {key}: {e}")))
    }

    /// Removes every entry whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::StoreUnavailable` if the store delete fails.
    pub async fn clear_cache_prefix(&self, prefix: &str) -> AuthResult<u64> {
        let removed = self.kv.delete_prefix(prefix).await.map_err(|e| {
            AuthError::store_unavailable(format!("cache delete for prefix {prefix}: {e}"))
        })?;
        tracing::debug!(prefix, removed, "cache prefix cleared");
        Ok(removed)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> AuthResult<Lookup<T>> {
        let raw = self
            .kv
            .get(key)
            .await
            .map_err(|e| AuthError::store_unavailable(format!("cache read for {key}: {e}")))?;

        let Some(raw) = raw else {
            return Ok(Lookup::Missing);
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable cache entry");
                return Ok(Lookup::Stale);
            }
        };

        Ok(if self.is_fresh(entry.written_at) {
            Lookup::Fresh(entry.value)
        } else {
            Lookup::Stale
        })
    }

    fn is_fresh(&self, written_at: i64) -> bool {
        let age = unix_millis(self.clock.now()) - written_at;
        // Entries stamped in the future are not trusted
        age >= 0 && (age as u128) < self.ttl.as_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{KvError, MemoryKvStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    fn setup(ttl: Duration) -> (CacheLayer, Arc<MemoryKvStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        let kv = Arc::new(MemoryKvStore::with_clock(clock.clone()));
        let config = CacheConfig { enabled: true, ttl };
        let cache = CacheLayer::new(kv.clone(), &config, clock.clone());
        (cache, kv, clock)
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_loader() {
        let (cache, _, clock) = setup(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first: u32 = cache
            .try_cache("entity:1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();

        clock.advance(time::Duration::seconds(59));
        let second: u32 = cache
            .try_cache("entity:1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        assert_eq!((first, second), (1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_reloads() {
        let (cache, _, clock) = setup(Duration::from_secs(60));
        let _: u32 = cache.try_cache("entity:1", || async { Ok(1) }).await.unwrap();

        clock.advance(time::Duration::seconds(60));
        let value: u32 = cache.try_cache("entity:1", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_reload() {
        let (cache, _, _) = setup(Duration::from_secs(60));
        let _: u32 = cache.try_cache("entity:1", || async { Ok(1) }).await.unwrap();

        cache.clear_cache("entity:1").await.unwrap();
        let value: u32 = cache.try_cache("entity:1", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let (cache, kv, _) = setup(Duration::from_secs(60));
        let result: AuthResult<u32> = cache
            .try_cache("entity:1", || async { Err(AuthError::not_found("entity 1")) })
            .await;
        assert!(matches!(result, Err(AuthError::NotFound { .. })));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_clear_prefix_leaves_point_entries() {
        let (cache, kv, _) = setup(Duration::from_secs(60));
        let list_key = CacheKey::account_list(&[("page", "1"), ("q", "al")]);
        assert_eq!(list_key, "accounts:page=1&q=al");

        let _: Vec<String> = cache
            .try_cache(&list_key, || async { Ok(vec!["a1".to_string()]) })
            .await
            .unwrap();
        let _: String = cache
            .try_cache(&CacheKey::account("a1"), || async { Ok("a1".to_string()) })
            .await
            .unwrap();

        assert_eq!(
            cache
                .clear_cache_prefix(CacheKey::ACCOUNT_LIST_PREFIX)
                .await
                .unwrap(),
            1
        );
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let (cache, kv, _) = setup(Duration::from_secs(60));
        kv.set("entity:1", "not json", None).await.unwrap();

        let value: u32 = cache.try_cache("entity:1", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces() {
        let (cache, kv, _) = setup(Duration::from_secs(60));
        kv.set_available(false);

        let result: AuthResult<u32> = cache.try_cache("entity:1", || async { Ok(1) }).await;
        assert!(matches!(result, Err(AuthError::StoreUnavailable { .. })));
    }

    /// Reads succeed, writes fail.
    struct ReadOnlyKv(MemoryKvStore);

    #[async_trait::async_trait]
    impl KvStore for ReadOnlyKv {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.0.get(key).await
        }

        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), KvError> {
            Err(KvError::Unavailable("read-only replica".to_string()))
        }

        async fn delete(&self, key: &str) -> Result<bool, KvError> {
            self.0.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
            self.0.delete_prefix(prefix).await
        }

        async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
            self.0.increment(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_back_returns_loaded_value() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
        };
        let cache = CacheLayer::new(Arc::new(ReadOnlyKv(MemoryKvStore::new())), &config, clock);

        let value: u32 = cache.try_cache("entity:1", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
        assert!(matches!(
            cache.put("entity:1", &5u32).await,
            Err(AuthError::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_loads() {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(MemoryKvStore::new());
        let config = CacheConfig {
            enabled: false,
            ttl: Duration::from_secs(60),
        };
        let cache = CacheLayer::new(kv.clone(), &config, clock);

        let _: u32 = cache.try_cache("k", || async { Ok(1) }).await.unwrap();
        let value: u32 = cache.try_cache("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
        assert!(kv.is_empty());
    }
}
