//! Account record storage.
//!
//! Account rows live on the shard owning the account id. The global
//! username index lives in `account_usernames` on the shard owning the
//! username, and its primary key is what enforces uniqueness across shards.
//! Writes touching both are not transactional: the mapping is claimed first
//! and released again if the row write fails.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;
use tracing::instrument;

use edgeguard_auth::account::AccountRecord;
use edgeguard_auth::keys::WrappedKey;
use edgeguard_auth::storage::AccountStorage;
use edgeguard_auth::{AuthError, AuthResult};

use crate::{PgPool, Schema, ShardRouter, StorageError, StorageResult};

// =============================================================================
// Row Mapping
// =============================================================================

/// Column tuple as selected by [`SELECT_COLUMNS`].
pub(crate) type AccountTuple = (
    String,
    String,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    serde_json::Value,
    Vec<u8>,
    Option<OffsetDateTime>,
    OffsetDateTime,
    OffsetDateTime,
);

const SELECT_COLUMNS: &str = "id, username, password_hash, password_salt, encrypted_blob, \
     wrapped_key, blob_iv, last_login, created_at, updated_at";

/// Builds a record from a selected row.
///
/// # Errors
///
/// Returns `StorageError::Serialization` if the wrapped key column does not
/// decode.
pub(crate) fn record_from_tuple(row: AccountTuple) -> StorageResult<AccountRecord> {
    let wrapped_key: WrappedKey = serde_json::from_value(row.5)?;
    Ok(AccountRecord {
        id: row.0,
        username: row.1,
        password_hash: row.2,
        password_salt: row.3,
        encrypted_blob: row.4,
        wrapped_key,
        blob_iv: row.6,
        last_login: row.7,
        created_at: row.8,
        updated_at: row.9,
    })
}

// =============================================================================
// Account Storage
// =============================================================================

/// PostgreSQL account storage.
#[derive(Clone)]
pub struct PostgresAccountStorage {
    router: Arc<dyn ShardRouter>,
    schema: Arc<Schema>,
}

impl PostgresAccountStorage {
    /// Create account storage over a router.
    #[must_use]
    pub fn new(router: Arc<dyn ShardRouter>, schema: Arc<Schema>) -> Self {
        Self { router, schema }
    }

    async fn ready(&self) -> AuthResult<()> {
        self.schema
            .ensure(self.router.as_ref())
            .await
            .map_err(|e| e.into_auth_error("ensure schema"))
    }

    fn account_shard(&self, id: &str) -> &PgPool {
        self.router.for_key(id)
    }

    fn username_shard(&self, username: &str) -> &PgPool {
        self.router.for_key(username)
    }

    async fn fetch(&self, id: &str) -> StorageResult<Option<AccountRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE id = $1");
        let row: Option<AccountTuple> = query_as(&sql)
            .bind(id)
            .fetch_optional(self.account_shard(id))
            .await?;
        row.map(record_from_tuple).transpose()
    }

    async fn lookup_username(&self, username: &str) -> StorageResult<Option<String>> {
        let row: Option<(String,)> =
            query_as("SELECT account_id FROM account_usernames WHERE username = $1")
                .bind(username)
                .fetch_optional(self.username_shard(username))
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn claim_username(&self, username: &str, account_id: &str) -> AuthResult<()> {
        query("INSERT INTO account_usernames (username, account_id) VALUES ($1, $2)")
            .bind(username)
            .bind(account_id)
            .execute(self.username_shard(username))
            .await
            .map_err(|e| {
                match StorageError::from_insert(e, || format!("username '{username}' is taken")) {
                    StorageError::Conflict(_) => AuthError::DuplicateUsername {
                        username: username.to_string(),
                    },
                    other => other.into_auth_error("claim username"),
                }
            })?;
        Ok(())
    }

    async fn release_username(&self, username: &str, account_id: &str) -> StorageResult<()> {
        query("DELETE FROM account_usernames WHERE username = $1 AND account_id = $2")
            .bind(username)
            .bind(account_id)
            .execute(self.username_shard(username))
            .await?;
        Ok(())
    }

    /// Releases a mapping after a failed write, logging instead of failing.
    async fn release_quietly(&self, username: &str, account_id: &str) {
        if let Err(e) = self.release_username(username, account_id).await {
            tracing::warn!(
                account_id = %account_id,
                error = %e,
                "Failed to release username mapping"
            );
        }
    }
}

#[async_trait]
impl AccountStorage for PostgresAccountStorage {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> AuthResult<Option<AccountRecord>> {
        self.ready().await?;
        self.fetch(id)
            .await
            .map_err(|e| e.into_auth_error("find account"))
    }

    #[instrument(skip(self))]
    async fn find_by_username(&self, username: &str) -> AuthResult<Option<AccountRecord>> {
        self.ready().await?;
        let Some(id) = self
            .lookup_username(username)
            .await
            .map_err(|e| e.into_auth_error("look up username"))?
        else {
            return Ok(None);
        };

        let record = self
            .fetch(&id)
            .await
            .map_err(|e| e.into_auth_error("find account"))?;

        // A mapping can briefly outlive its row after a partial delete
        Ok(record.filter(|r| r.username == username))
    }

    async fn username_exists(&self, username: &str) -> AuthResult<bool> {
        self.ready().await?;
        let (exists,): (bool,) =
            query_as("SELECT EXISTS (SELECT 1 FROM account_usernames WHERE username = $1)")
                .bind(username)
                .fetch_one(self.username_shard(username))
                .await
                .map_err(|e| StorageError::from(e).into_auth_error("check username"))?;
        Ok(exists)
    }

    #[instrument(skip(self, record), fields(account_id = %record.id))]
    async fn insert(&self, record: &AccountRecord) -> AuthResult<()> {
        self.ready().await?;
        self.claim_username(&record.username, &record.id).await?;

        let wrapped_key = serde_json::to_value(&record.wrapped_key)
            .map_err(|e| StorageError::from(e).into_auth_error("encode wrapped key"))?;

        let result = query(
            r#"
            INSERT INTO accounts (
                id, username, password_hash, password_salt, encrypted_blob,
                wrapped_key, blob_iv, last_login, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.id)
        .bind(&record.username)
        .bind(&record.password_hash)
        .bind(&record.password_salt)
        .bind(&record.encrypted_blob)
        .bind(&wrapped_key)
        .bind(&record.blob_iv)
        .bind(record.last_login)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.account_shard(&record.id))
        .await;

        if let Err(e) = result {
            self.release_quietly(&record.username, &record.id).await;
            let id = record.id.clone();
            return Err(StorageError::from_insert(e, || format!("account '{id}' already exists"))
                .into_auth_error("insert account"));
        }

        Ok(())
    }

    #[instrument(skip(self, record), fields(account_id = %record.id))]
    async fn update(&self, record: &AccountRecord) -> AuthResult<()> {
        self.ready().await?;
        let current = self
            .fetch(&record.id)
            .await
            .map_err(|e| e.into_auth_error("find account"))?
            .ok_or_else(|| AuthError::not_found(format!("account {}", record.id)))?;

        let renamed = current.username != record.username;
        if renamed {
            self.claim_username(&record.username, &record.id).await?;
        }

        let wrapped_key = serde_json::to_value(&record.wrapped_key)
            .map_err(|e| StorageError::from(e).into_auth_error("encode wrapped key"))?;

        let result = query(
            r#"
            UPDATE accounts
            SET username = $2, password_hash = $3, password_salt = $4,
                encrypted_blob = $5, wrapped_key = $6, blob_iv = $7,
                last_login = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.username)
        .bind(&record.password_hash)
        .bind(&record.password_salt)
        .bind(&record.encrypted_blob)
        .bind(&wrapped_key)
        .bind(&record.blob_iv)
        .bind(record.last_login)
        .bind(record.updated_at)
        .execute(self.account_shard(&record.id))
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                if renamed {
                    self.release_quietly(&record.username, &record.id).await;
                }
                Err(AuthError::not_found(format!("account {}", record.id)))
            }
            Ok(_) => {
                if renamed {
                    self.release_quietly(&current.username, &record.id).await;
                }
                Ok(())
            }
            Err(e) => {
                if renamed {
                    self.release_quietly(&record.username, &record.id).await;
                }
                Err(StorageError::from(e).into_auth_error("update account"))
            }
        }
    }

    async fn update_last_login(&self, id: &str, at: OffsetDateTime) -> AuthResult<()> {
        self.ready().await?;
        query("UPDATE accounts SET last_login = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.account_shard(id))
            .await
            .map_err(|e| StorageError::from(e).into_auth_error("record login"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> AuthResult<bool> {
        self.ready().await?;
        let deleted: Option<(String,)> =
            query_as("DELETE FROM accounts WHERE id = $1 RETURNING username")
                .bind(id)
                .fetch_optional(self.account_shard(id))
                .await
                .map_err(|e| StorageError::from(e).into_auth_error("delete account"))?;

        let Some((username,)) = deleted else {
            return Ok(false);
        };

        self.release_username(&username, id)
            .await
            .map_err(|e| e.into_auth_error("release username"))?;
        Ok(true)
    }
}
