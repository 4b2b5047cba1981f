//! Table definitions and idempotent schema creation.

use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use sqlx_core::query::query;

use crate::{PgPool, ShardRouter, StorageResult};

/// DDL run on every shard, in order. Each statement is idempotent.
pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        password_hash BYTEA NOT NULL,
        password_salt BYTEA NOT NULL,
        encrypted_blob BYTEA NOT NULL,
        wrapped_key JSONB NOT NULL,
        blob_iv BYTEA NOT NULL,
        last_login TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS accounts_username_idx ON accounts (username)",
    r#"
    CREATE TABLE IF NOT EXISTS account_usernames (
        username TEXT PRIMARY KEY,
        account_id TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS account_usernames_account_id_idx ON account_usernames (account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS tokens (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        encrypted_token BYTEA,
        token_hash TEXT NOT NULL,
        lookup_hash TEXT NOT NULL,
        salt TEXT NOT NULL,
        is_session BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL DEFAULT (NOW() + INTERVAL '30 days')
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS tokens_lookup_hash_idx ON tokens (lookup_hash)",
    "CREATE INDEX IF NOT EXISTS tokens_owner_id_idx ON tokens (owner_id)",
    "CREATE INDEX IF NOT EXISTS tokens_is_session_idx ON tokens (is_session)",
    "CREATE INDEX IF NOT EXISTS tokens_expires_at_idx ON tokens (expires_at)",
];

/// Creates the tables on one pool.
///
/// # Errors
///
/// Returns an error if any statement fails.
#[instrument(skip(pool))]
pub async fn create_tables(pool: &PgPool) -> StorageResult<()> {
    for statement in STATEMENTS {
        query(*statement).execute(pool).await?;
    }
    debug!(statements = STATEMENTS.len(), "Schema ensured");
    Ok(())
}

/// Tracks whether the schema has been created in this process.
#[derive(Debug, Default)]
pub struct Schema {
    ready: OnceCell<()>,
}

impl Schema {
    /// New, not yet ensured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the tables on every shard the first time it is called.
    ///
    /// A failed attempt is not remembered; the next call retries.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails on any shard.
    pub async fn ensure(&self, router: &dyn ShardRouter) -> StorageResult<()> {
        self.ready
            .get_or_try_init(|| async {
                for pool in router.all() {
                    create_tables(pool).await?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Returns `true` once the schema has been created.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }
}
