//! Token record storage.
//!
//! Rows are placed by lookup hash, so bearer verification is one indexed
//! read on one shard. Queries keyed by owner cannot be routed and fan out to
//! every shard concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;
use tracing::instrument;

use edgeguard_auth::session::TokenRecord;
use edgeguard_auth::storage::TokenStorage;
use edgeguard_auth::AuthResult;

use crate::{PgPool, Schema, ShardRouter, StorageError, StorageResult};

// =============================================================================
// Row Mapping
// =============================================================================

pub(crate) type TokenTuple = (
    String,
    String,
    Option<Vec<u8>>,
    String,
    String,
    String,
    bool,
    OffsetDateTime,
    OffsetDateTime,
);

const SELECT_COLUMNS: &str = "id, owner_id, encrypted_token, token_hash, lookup_hash, salt, \
     is_session, created_at, expires_at";

pub(crate) fn record_from_tuple(row: TokenTuple) -> TokenRecord {
    TokenRecord {
        id: row.0,
        owner_id: row.1,
        encrypted_token: row.2,
        token_hash: row.3,
        lookup_hash: row.4,
        salt: row.5,
        is_session: row.6,
        created_at: row.7,
        expires_at: row.8,
    }
}

/// Orders newest first, ties broken by id for a stable listing.
fn sort_newest_first(records: &mut [TokenRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

// =============================================================================
// Token Storage
// =============================================================================

/// PostgreSQL token storage.
#[derive(Clone)]
pub struct PostgresTokenStorage {
    router: Arc<dyn ShardRouter>,
    schema: Arc<Schema>,
}

impl PostgresTokenStorage {
    /// Create token storage over a router.
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

    fn shard(&self, lookup_hash: &str) -> &PgPool {
        self.router.for_key(lookup_hash)
    }

    /// Runs a row-counting statement with one or two text binds on every shard.
    async fn execute_everywhere(&self, sql: &str, first: &str, second: Option<&str>) -> StorageResult<u64> {
        let counts = try_join_all(self.router.all().into_iter().map(|pool| async move {
            let mut statement = query(sql).bind(first);
            if let Some(second) = second {
                statement = statement.bind(second);
            }
            statement
                .execute(pool)
                .await
                .map(|done| done.rows_affected())
        }))
        .await?;
        Ok(counts.into_iter().sum())
    }

    async fn select_everywhere(&self, sql: &str, owner_id: &str, id: Option<&str>) -> StorageResult<Vec<TokenRecord>> {
        let shards = try_join_all(self.router.all().into_iter().map(|pool| async move {
            let mut statement = query_as::<_, TokenTuple>(sql).bind(owner_id);
            if let Some(id) = id {
                statement = statement.bind(id);
            }
            statement.fetch_all(pool).await
        }))
        .await?;

        Ok(shards
            .into_iter()
            .flatten()
            .map(record_from_tuple)
            .collect())
    }
}

#[async_trait]
impl TokenStorage for PostgresTokenStorage {
    #[instrument(skip(self, token), fields(token_id = %token.id, owner_id = %token.owner_id))]
    async fn insert(&self, token: &TokenRecord) -> AuthResult<()> {
        self.ready().await?;
        query(
            r#"
            INSERT INTO tokens (
                id, owner_id, encrypted_token, token_hash, lookup_hash, salt,
                is_session, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&token.id)
        .bind(&token.owner_id)
        .bind(&token.encrypted_token)
        .bind(&token.token_hash)
        .bind(&token.lookup_hash)
        .bind(&token.salt)
        .bind(token.is_session)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(self.shard(&token.lookup_hash))
        .await
        .map_err(|e| {
            StorageError::from_insert(e, || format!("token '{}' already exists", token.id))
                .into_auth_error("insert token")
        })?;
        Ok(())
    }

    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<Option<TokenRecord>> {
        self.ready().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tokens WHERE lookup_hash = $1");
        let row: Option<TokenTuple> = query_as(&sql)
            .bind(lookup_hash)
            .fetch_optional(self.shard(lookup_hash))
            .await
            .map_err(|e| StorageError::from(e).into_auth_error("find token"))?;
        Ok(row.map(record_from_tuple))
    }

    async fn find_by_id(&self, owner_id: &str, id: &str) -> AuthResult<Option<TokenRecord>> {
        self.ready().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tokens WHERE owner_id = $1 AND id = $2");
        let records = self
            .select_everywhere(&sql, owner_id, Some(id))
            .await
            .map_err(|e| e.into_auth_error("find token"))?;
        Ok(records.into_iter().next())
    }

    async fn delete_by_lookup_hash(&self, lookup_hash: &str) -> AuthResult<bool> {
        self.ready().await?;
        let done = query("DELETE FROM tokens WHERE lookup_hash = $1")
            .bind(lookup_hash)
            .execute(self.shard(lookup_hash))
            .await
            .map_err(|e| StorageError::from(e).into_auth_error("revoke token"))?;
        Ok(done.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_by_id(&self, owner_id: &str, id: &str) -> AuthResult<bool> {
        self.ready().await?;
        let removed = self
            .execute_everywhere("DELETE FROM tokens WHERE owner_id = $1 AND id = $2", owner_id, Some(id))
            .await
            .map_err(|e| e.into_auth_error("revoke token"))?;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn delete_sessions_for_owner(&self, owner_id: &str) -> AuthResult<u64> {
        self.ready().await?;
        self.execute_everywhere("DELETE FROM tokens WHERE owner_id = $1 AND is_session", owner_id, None)
            .await
            .map_err(|e| e.into_auth_error("revoke sessions"))
    }

    #[instrument(skip(self))]
    async fn delete_all_for_owner(&self, owner_id: &str) -> AuthResult<u64> {
        self.ready().await?;
        self.execute_everywhere("DELETE FROM tokens WHERE owner_id = $1", owner_id, None)
            .await
            .map_err(|e| e.into_auth_error("revoke tokens"))
    }

    async fn list_for_owner(&self, owner_id: &str) -> AuthResult<Vec<TokenRecord>> {
        self.ready().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tokens WHERE owner_id = $1");
        let mut records = self
            .select_everywhere(&sql, owner_id, None)
            .await
            .map_err(|e| e.into_auth_error("list tokens"))?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        self.ready().await?;
        let counts = try_join_all(self.router.all().into_iter().map(|pool| async move {
            query("DELETE FROM tokens WHERE expires_at < $1")
                .bind(now)
                .execute(pool)
                .await
                .map(|done| done.rows_affected())
        }))
        .await
        .map_err(|e| StorageError::from(e).into_auth_error("purge expired tokens"))?;
        Ok(counts.into_iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeguard_auth::TokenKind;
    use time::macros::datetime;

    fn tuple(id: &str, created_at: OffsetDateTime, is_session: bool) -> TokenTuple {
        (
            id.to_string(),
            "u1".to_string(),
            None,
            "verifier".to_string(),
            format!("lookup-{id}"),
            "00ff".to_string(),
            is_session,
            created_at,
            created_at + time::Duration::days(30),
        )
    }

    #[test]
    fn test_record_from_tuple() {
        let record = record_from_tuple(tuple("t1", datetime!(2024-01-01 00:00 UTC), false));
        assert_eq!(record.id, "t1");
        assert_eq!(record.owner_id, "u1");
        assert_eq!(record.lookup_hash, "lookup-t1");
        assert_eq!(record.kind(), TokenKind::Api);
        assert_eq!(record.expires_at, datetime!(2024-01-31 00:00 UTC));
    }

    #[test]
    fn test_fan_out_results_sorted_newest_first() {
        let mut records = vec![
            record_from_tuple(tuple("b", datetime!(2024-01-01 00:00 UTC), true)),
            record_from_tuple(tuple("c", datetime!(2024-03-01 00:00 UTC), true)),
            record_from_tuple(tuple("a", datetime!(2024-01-01 00:00 UTC), true)),
        ];
        sort_newest_first(&mut records);

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
