//! PostgreSQL storage backend for Edgeguard auth
//!
//! Provides persistent storage for:
//!
//! - Account secret records (`accounts`)
//! - The global username index (`account_usernames`)
//! - Session and API token records (`tokens`)
//!
//! Every query runs through a [`ShardRouter`]: account rows are placed by
//! account id, username mappings by username and token rows by lookup hash.
//! Per-owner token queries fan out to all shards concurrently.
//!
//! Tables are created idempotently on first access.
//!
//! # Example
//!
//! ```ignore
//! use edgeguard_auth_postgres::PostgresAuthStorage;
//!
//! let storage = PostgresAuthStorage::connect("postgres://localhost/edgeguard").await?;
//! let services = AuthServices::new(config, storage.accounts(), storage.tokens(), kv)?;
//! ```

pub mod account;
pub mod router;
pub mod schema;
pub mod token;

use std::sync::Arc;

use edgeguard_auth::AuthError;
use sqlx_core::pool::Pool;
use sqlx_postgres::Postgres;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

pub use account::PostgresAccountStorage;
pub use router::{ShardRouter, SinglePool};
pub use schema::Schema;
pub use token::PostgresTokenStorage;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    /// Requested row was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row already exists (conflict).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input data.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    /// Create a `NotFound` error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create an `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns `true` if the database could not be reached at all.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx_core::Error::PoolTimedOut
                    | sqlx_core::Error::PoolClosed
                    | sqlx_core::Error::Io(_)
                    | sqlx_core::Error::Tls(_)
            )
        )
    }

    /// Returns `true` if this is a client error (4xx equivalent).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Conflict(_) | Self::InvalidInput(_)
        )
    }

    /// Converts into the service error, prefixing the failed operation.
    #[must_use]
    pub fn into_auth_error(self, operation: &str) -> AuthError {
        let message = format!("{operation}: {self}");
        match self {
            Self::NotFound(_) => AuthError::not_found(message),
            Self::InvalidInput(_) => AuthError::validation(message),
            ref e if e.is_unavailable() => AuthError::store_unavailable(message),
            _ => AuthError::storage(message),
        }
    }

    /// Maps a unique violation to `Conflict`, leaving other errors as they are.
    pub(crate) fn from_insert(err: sqlx_core::Error, what: impl FnOnce() -> String) -> Self {
        if let sqlx_core::Error::Database(ref db_err) = err
            && db_err.is_unique_violation()
        {
            return Self::conflict(what());
        }
        Self::from(err)
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// PostgreSQL Auth Storage
// =============================================================================

/// PostgreSQL storage backend for account and token records.
///
/// Holds the shard router and schema state shared by the account and token
/// stores it hands out.
#[derive(Clone)]
pub struct PostgresAuthStorage {
    router: Arc<dyn ShardRouter>,
    schema: Arc<Schema>,
}

impl PostgresAuthStorage {
    /// Create storage over a shard router.
    #[must_use]
    pub fn new(router: Arc<dyn ShardRouter>) -> Self {
        Self {
            router,
            schema: Arc::new(Schema::new()),
        }
    }

    /// Create storage by connecting a single pool to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        use sqlx_core::pool::PoolOptions;
        let pool = PoolOptions::<Postgres>::new().connect(database_url).await?;
        Ok(Self::new(Arc::new(SinglePool::new(pool))))
    }

    /// Get the shard router.
    #[must_use]
    pub fn router(&self) -> &Arc<dyn ShardRouter> {
        &self.router
    }

    /// Creates every table and index on all shards.
    ///
    /// Storage also does this lazily on first access; calling it up front
    /// surfaces schema errors at startup instead.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> StorageResult<()> {
        self.schema.ensure(self.router.as_ref()).await
    }

    /// Account storage sharing this backend's router.
    #[must_use]
    pub fn accounts(&self) -> Arc<PostgresAccountStorage> {
        Arc::new(PostgresAccountStorage::new(
            Arc::clone(&self.router),
            Arc::clone(&self.schema),
        ))
    }

    /// Token storage sharing this backend's router.
    #[must_use]
    pub fn tokens(&self) -> Arc<PostgresTokenStorage> {
        Arc::new(PostgresTokenStorage::new(
            Arc::clone(&self.router),
            Arc::clone(&self.schema),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_not_found() {
        let err = StorageError::not_found("account a1");
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Not found: account a1");

        let auth = err.into_auth_error("get account");
        assert!(matches!(auth, AuthError::NotFound { .. }));
        assert_eq!(auth.status_code(), 404);
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let err = StorageError::from(sqlx_core::Error::PoolTimedOut);
        assert!(err.is_unavailable());
        assert!(!err.is_client_error());
        assert!(matches!(
            err.into_auth_error("find token"),
            AuthError::StoreUnavailable { .. }
        ));
    }

    #[test]
    fn test_row_not_found_is_plain_storage_error() {
        let err = StorageError::from(sqlx_core::Error::RowNotFound);
        assert!(!err.is_unavailable());
        assert!(matches!(
            err.into_auth_error("update account"),
            AuthError::Storage { .. }
        ));
    }

    #[test]
    fn test_serialization_error_keeps_context() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let auth = StorageError::from(json_err).into_auth_error("decode wrapped key");
        match auth {
            AuthError::Storage { message } => assert!(message.starts_with("decode wrapped key: ")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_input_is_validation() {
        let auth = StorageError::invalid_input("empty id").into_auth_error("insert token");
        assert_eq!(auth.status_code(), 400);
    }
}
