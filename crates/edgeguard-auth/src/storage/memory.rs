//! In-process storage backends.
//!
//! These back the test suites and single-node tooling. They honor the same
//! contracts as the network backends, including username uniqueness and
//! key expiry, and [`MemoryKvStore`] can simulate an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::account::AccountRecord;
use crate::clock::{Clock, SystemClock};
use crate::error::AuthError;
use crate::session::TokenRecord;
use crate::storage::{AccountStorage, KvError, KvStore, TokenStorage};

fn poisoned<T>(_: T) -> AuthError {
    AuthError::internal("in-memory store lock poisoned")
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Default)]
struct AccountTables {
    by_id: HashMap<String, AccountRecord>,
    usernames: HashMap<String, String>,
}

/// In-memory [`AccountStorage`].
#[derive(Default)]
pub struct MemoryAccountStorage {
    tables: RwLock<AccountTables>,
}

impl MemoryAccountStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.by_id.len()).unwrap_or(0)
    }

    /// Returns `true` if no accounts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AccountStorage for MemoryAccountStorage {
    async fn find_by_id(&self, id: &str) -> AuthResult<Option<AccountRecord>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.by_id.get(id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> AuthResult<Option<AccountRecord>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .usernames
            .get(username)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn username_exists(&self, username: &str) -> AuthResult<bool> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.usernames.contains_key(username))
    }

    async fn insert(&self, record: &AccountRecord) -> AuthResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if tables.usernames.contains_key(&record.username) {
            return Err(AuthError::DuplicateUsername {
                username: record.username.clone(),
            });
        }
        if tables.by_id.contains_key(&record.id) {
            return Err(AuthError::storage(format!(
                "account {} already exists",
                record.id
            )));
        }
        tables
            .usernames
            .insert(record.username.clone(), record.id.clone());
        tables.by_id.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &AccountRecord) -> AuthResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        let previous = tables
            .by_id
            .get(&record.id)
            .map(|r| r.username.clone())
            .ok_or_else(|| AuthError::not_found(format!("account {}", record.id)))?;

        if previous != record.username {
            if tables.usernames.contains_key(&record.username) {
                return Err(AuthError::DuplicateUsername {
                    username: record.username.clone(),
                });
            }
            tables.usernames.remove(&previous);
            tables
                .usernames
                .insert(record.username.clone(), record.id.clone());
        }
        tables.by_id.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_last_login(&self, id: &str, at: OffsetDateTime) -> AuthResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if let Some(record) = tables.by_id.get_mut(id) {
            record.last_login = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> AuthResult<bool> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        match tables.by_id.remove(id) {
            Some(record) => {
                tables.usernames.remove(&record.username);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// =============================================================================
// Tokens
// =============================================================================

/// In-memory [`TokenStorage`], keyed by lookup hash.
#[derive(Default)]
pub struct MemoryTokenStorage {
    tokens: RwLock<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tokens, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Returns `true` if no tokens are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, predicate: impl Fn(&TokenRecord) -> bool) -> AuthResult<u64> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        let before = tokens.len();
        tokens.retain(|_, t| !predicate(t));
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn insert(&self, token: &TokenRecord) -> AuthResult<()> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        if tokens.contains_key(&token.lookup_hash) {
            return Err(AuthError::storage("token lookup hash already exists"));
        }
        tokens.insert(token.lookup_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<Option<TokenRecord>> {
        let tokens = self.tokens.read().map_err(poisoned)?;
        Ok(tokens.get(lookup_hash).cloned())
    }

    async fn find_by_id(&self, owner_id: &str, id: &str) -> AuthResult<Option<TokenRecord>> {
        let tokens = self.tokens.read().map_err(poisoned)?;
        Ok(tokens
            .values()
            .find(|t| t.id == id && t.owner_id == owner_id)
            .cloned())
    }

    async fn delete_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<bool> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        Ok(tokens.remove(lookup_hash).is_some())
    }

    async fn delete_by_id(&self, owner_id: &str, id: &str) -> AuthResult<bool> {
        self.remove_where(|t| t.id == id && t.owner_id == owner_id)
            .map(|n| n > 0)
    }

    async fn delete_sessions_for_owner(&self, owner_id: &str) -> AuthResult<u64> {
        self.remove_where(|t| t.is_session && t.owner_id == owner_id)
    }

    async fn delete_all_for_owner(&self, owner_id: &str) -> AuthResult<u64> {
        self.remove_where(|t| t.owner_id == owner_id)
    }

    async fn list_for_owner(&self, owner_id: &str) -> AuthResult<Vec<TokenRecord>> {
        let tokens = self.tokens.read().map_err(poisoned)?;
        let mut owned: Vec<TokenRecord> = tokens
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        self.remove_where(|t| t.expires_at < now)
    }
}

// =============================================================================
// Key-value
// =============================================================================

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<OffsetDateTime>,
}

impl KvEntry {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory [`KvStore`] with clock-driven expiry.
///
/// [`set_available(false)`](Self::set_available) makes every operation fail
/// with [`KvError::Unavailable`], simulating a store outage.
pub struct MemoryKvStore {
    entries: DashMap<String, KvEntry>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store on the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Toggles simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the remaining time-to-live of `key`, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        let remaining = entry.expires_at? - now;
        Duration::try_from(remaining).ok()
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Returns `true` if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("simulated outage".to_string()))
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<OffsetDateTime> {
        ttl.map(|ttl| self.clock.now() + ttl)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.is_live(now)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut removed = 0;
        // Expired entries are evicted on the same sweep but not counted
        self.entries.retain(|k, e| {
            let live = e.is_live(now);
            if k.starts_with(prefix) {
                removed += u64::from(live);
                return false;
            }
            live
        });
        Ok(removed)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = self.expiry(Some(ttl));

        let mut entry = self.entries.entry(key.to_string()).or_insert(KvEntry {
            value: "0".to_string(),
            expires_at,
        });
        let current = if entry.is_live(now) {
            entry
                .value
                .parse::<i64>()
                .map_err(|_| KvError::Operation(format!("value at {key} is not an integer")))?
        } else {
            0
        };

        let next = current + 1;
        entry.value = next.to_string();
        entry.expires_at = expires_at;
        Ok(next)
    }
}
