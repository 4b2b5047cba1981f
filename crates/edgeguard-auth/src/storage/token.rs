//! Token record storage trait.
//!
//! # Security Considerations
//!
//! - Records never contain a raw token, only its verifier and lookup hash
//! - Lookups go through the unique lookup hash index, never a scan
//! - Revocation is deletion; there is no "revoked" state to check

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::session::TokenRecord;

/// Storage trait for bearer and session token records.
///
/// # Implementations
///
/// - [`MemoryTokenStorage`](super::MemoryTokenStorage)
/// - PostgreSQL (in `edgeguard-auth-postgres` crate)
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Stores a new token record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup hash already exists or the storage
    /// operation fails.
    async fn insert(&self, token: &TokenRecord) -> AuthResult<()>;

    /// Finds a token by its lookup hash.
    ///
    /// Returns the record regardless of expiry; callers check `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<Option<TokenRecord>>;

    /// Finds a token by id, scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_id(&self, owner_id: &str, id: &str) -> AuthResult<Option<TokenRecord>>;

    /// Deletes the token with this lookup hash. Returns `true` if deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<bool>;

    /// Deletes a token by id, scoped to its owner. Returns `true` if deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_by_id(&self, owner_id: &str, id: &str) -> AuthResult<bool>;

    /// Deletes every session token (`is_session = true`) of an owner.
    ///
    /// Returns the number of tokens deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_sessions_for_owner(&self, owner_id: &str) -> AuthResult<u64>;

    /// Deletes every token of an owner. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_all_for_owner(&self, owner_id: &str) -> AuthResult<u64>;

    /// Lists every token of an owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_for_owner(&self, owner_id: &str) -> AuthResult<Vec<TokenRecord>>;

    /// Deletes tokens whose `expires_at` is before `now`.
    ///
    /// Expired tokens are already rejected at verification time; this only
    /// reclaims space and is never called on the request path.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64>;
}
