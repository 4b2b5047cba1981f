//! Account record storage trait.
//!
//! # Security Considerations
//!
//! - Records hold only hashes, wrapped keys and ciphertext
//! - Never log password hashes or blobs
//! - The username index must stay consistent with the account rows

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::account::AccountRecord;

/// Storage trait for account secret records.
///
/// Implementations keep two logical structures: the account rows keyed by
/// id and a unique username index pointing at them.
///
/// # Implementations
///
/// - [`MemoryAccountStorage`](super::MemoryAccountStorage)
/// - PostgreSQL (in `edgeguard-auth-postgres` crate)
#[async_trait]
pub trait AccountStorage: Send + Sync {
    /// Finds an account record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_id(&self, id: &str) -> AuthResult<Option<AccountRecord>>;

    /// Finds an account record by username.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_username(&self, username: &str) -> AuthResult<Option<AccountRecord>>;

    /// Returns `true` if the username is taken.
    ///
    /// This is an advisory check. It is not atomic with [`insert`](Self::insert).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn username_exists(&self, username: &str) -> AuthResult<bool>;

    /// Inserts a new record and its username mapping.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DuplicateUsername` if the username was claimed
    /// concurrently, or an error if the storage operation fails.
    async fn insert(&self, record: &AccountRecord) -> AuthResult<()>;

    /// Replaces an existing record.
    ///
    /// If the username changed, the old mapping is removed and the new one
    /// claimed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotFound` if no record has this id,
    /// `AuthError::DuplicateUsername` if the new username is taken, or an
    /// error if the storage operation fails.
    async fn update(&self, record: &AccountRecord) -> AuthResult<()>;

    /// Records a successful login.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn update_last_login(&self, id: &str, at: OffsetDateTime) -> AuthResult<()>;

    /// Deletes a record and its username mapping.
    ///
    /// Returns `true` if a record was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, id: &str) -> AuthResult<bool>;
}
