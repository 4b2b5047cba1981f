//! Password hashing and envelope-encrypted account records.
//!
//! # Security
//!
//! - Passwords are hashed with Argon2id and a fresh 16-byte salt
//! - Password length is checked before any derivation runs
//! - Hash comparison is constant time
//! - Each account has its own data key, wrapped under the root key; profile
//!   edits re-encrypt under the same key with a fresh IV
//! - Only the encrypted profile and wrapped key are ever cached; the
//!   password salt and hash stay in the account store
//! - An unknown username costs one Argon2id derivation, like a wrong password

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::instrument;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::AuthResult;
use crate::account::{Account, AccountBuilder, AccountPatch, AccountRecord, validate_password};
use crate::cache::{CacheKey, CacheLayer};
use crate::clock::Clock;
use crate::config::{AuthConfig, PasswordConfig};
use crate::crypto::{constant_time_eq, generate_salt};
use crate::error::AuthError;
use crate::keys::{
    DataKey, RootKey, WrappedKey, decrypt_raw, encrypt_raw, generate_iv, hex_bytes, rewrap_key,
    unwrap_key, wrap_key,
};
use crate::storage::{AccountStorage, TokenStorage};

/// Length of the Argon2id output in bytes.
pub const HASH_SIZE: usize = 32;

/// Associated data bound to every account blob.
const ACCOUNT_BLOB_AAD: &[u8] = b"edgeguard-account-v1";

/// Salt and digest of a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedPassword {
    /// Argon2id output.
    pub hash: Vec<u8>,
    /// Salt the hash was derived with.
    pub salt: Vec<u8>,
}

// =============================================================================
// Password hashing
// =============================================================================

/// Hashes `password` with Argon2id.
///
/// A fresh salt is generated when `salt` is `None`.
///
/// # Errors
///
/// Returns `AuthError::Validation` if the password length is outside the
/// policy bounds (checked before any derivation), or
/// `AuthError::Configuration` if the cost parameters are invalid.
pub fn hash_password(
    password: &str,
    salt: Option<&[u8]>,
    policy: &PasswordConfig,
) -> AuthResult<HashedPassword> {
    validate_password(password, policy).map_err(|e| AuthError::validation(e.to_string()))?;

    let salt = match salt {
        Some(salt) => salt.to_vec(),
        None => generate_salt().to_vec(),
    };
    let hash = derive(password, &salt, policy)?;
    Ok(HashedPassword {
        hash: hash.to_vec(),
        salt,
    })
}

/// Checks `password` against a stored salt and hash in constant time.
///
/// Passwords longer than the policy maximum are rejected without running
/// the derivation.
///
/// # Errors
///
/// Returns `AuthError::Configuration` if the cost parameters are invalid.
pub fn verify_password(
    password: &str,
    salt: &[u8],
    hash: &[u8],
    policy: &PasswordConfig,
) -> AuthResult<bool> {
    if password.chars().count() > policy.max_length {
        return Ok(false);
    }
    let candidate = derive(password, salt, policy)?;
    Ok(constant_time_eq(candidate.as_slice(), hash))
}

fn derive(
    password: &str,
    salt: &[u8],
    policy: &PasswordConfig,
) -> AuthResult<Zeroizing<[u8; HASH_SIZE]>> {
    let params = Params::new(
        policy.memory_kib,
        policy.iterations,
        policy.parallelism,
        Some(HASH_SIZE),
    )
    .map_err(|e| AuthError::configuration(format!("Invalid Argon2 parameters: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut output = Zeroizing::new([0u8; HASH_SIZE]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut output[..])
        .map_err(|e| AuthError::internal(format!("Password hashing failed: {e}")))?;
    Ok(output)
}

/// Runs [`hash_password`] on the blocking thread pool.
async fn hash_password_blocking(
    password: Zeroizing<String>,
    policy: PasswordConfig,
) -> AuthResult<HashedPassword> {
    tokio::task::spawn_blocking(move || hash_password(&password, None, &policy))
        .await
        .map_err(|e| AuthError::internal(format!("Password hashing task failed: {e}")))?
}

/// Runs [`verify_password`] on the blocking thread pool.
async fn verify_password_blocking(
    password: Zeroizing<String>,
    salt: Vec<u8>,
    hash: Vec<u8>,
    policy: PasswordConfig,
) -> AuthResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &salt, &hash, &policy))
        .await
        .map_err(|e| AuthError::internal(format!("Password verification task failed: {e}")))?
}

/// Runs [`decoy_password`] on the blocking thread pool.
async fn decoy_password_blocking(policy: PasswordConfig) -> AuthResult<HashedPassword> {
    tokio::task::spawn_blocking(move || decoy_password(&policy))
        .await
        .map_err(|e| AuthError::internal(format!("Decoy hashing task failed: {e}")))?
}

// =============================================================================
// Blob encryption
// =============================================================================

/// Encrypts a serialized account under its data key.
///
/// # Errors
///
/// Returns `AuthError::Internal` if the IV has the wrong size.
pub fn encrypt_account_blob(plaintext: &[u8], key: &DataKey, iv: &[u8]) -> AuthResult<Vec<u8>> {
    encrypt_raw(key.as_bytes(), iv, plaintext, ACCOUNT_BLOB_AAD)
}

/// Decrypts a serialized account.
///
/// # Errors
///
/// Returns `AuthError::Decryption` if the ciphertext, IV or key do not match.
pub fn decrypt_account_blob(
    ciphertext: &[u8],
    key: &DataKey,
    iv: &[u8],
) -> AuthResult<Zeroizing<Vec<u8>>> {
    decrypt_raw(key.as_bytes(), iv, ciphertext, ACCOUNT_BLOB_AAD)
}

// =============================================================================
// Credential store
// =============================================================================

/// Cache entry for an account: everything needed to decrypt the profile,
/// and nothing that verifies a password.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedAccount {
    id: String,
    username: String,
    #[serde(with = "hex_bytes")]
    encrypted_blob: Vec<u8>,
    wrapped_key: WrappedKey,
    #[serde(with = "hex_bytes")]
    blob_iv: Vec<u8>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_login: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

impl From<&AccountRecord> for SealedAccount {
    fn from(record: &AccountRecord) -> Self {
        Self {
            id: record.id.clone(),
            username: record.username.clone(),
            encrypted_blob: record.encrypted_blob.clone(),
            wrapped_key: record.wrapped_key.clone(),
            blob_iv: record.blob_iv.clone(),
            last_login: record.last_login,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Salt and hash of a random secret under the current policy, verified
/// against when a username is unknown.
fn decoy_password(policy: &PasswordConfig) -> AuthResult<HashedPassword> {
    let secret = Zeroizing::new(hex::encode(generate_salt()));
    let salt = generate_salt().to_vec();
    let hash = derive(&secret, &salt, policy)?;
    Ok(HashedPassword {
        hash: hash.to_vec(),
        salt,
    })
}

/// Account persistence with password hashing and envelope encryption.
pub struct CredentialStore {
    accounts: Arc<dyn AccountStorage>,
    tokens: Arc<dyn TokenStorage>,
    cache: Option<Arc<CacheLayer>>,
    config: Arc<AuthConfig>,
    root_key: RootKey,
    clock: Arc<dyn Clock>,
    decoy: OnceCell<HashedPassword>,
}

impl CredentialStore {
    /// Creates a credential store.
    pub fn new(
        accounts: Arc<dyn AccountStorage>,
        tokens: Arc<dyn TokenStorage>,
        config: Arc<AuthConfig>,
        root_key: RootKey,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            tokens,
            cache: None,
            config,
            root_key,
            clock,
            decoy: OnceCell::new(),
        }
    }

    /// Serves account reads through `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validates and saves a new account.
    ///
    /// Generates the password salt and hash, a fresh data key wrapped under
    /// the root key, and the encrypted profile.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidAccount` if the draft is invalid (nothing
    /// is written), `AuthError::DuplicateUsername` if the name is taken,
    /// possibly by a concurrent registration, or a storage error.
    #[instrument(skip(self, draft))]
    pub async fn create_account(&self, draft: AccountBuilder) -> AuthResult<Account> {
        let draft = draft
            .validate(&self.config.password)
            .map_err(|errors| AuthError::InvalidAccount { errors })?;

        // Advisory check; the insert below can still lose a race
        if self.accounts.username_exists(draft.username()).await? {
            return Err(AuthError::DuplicateUsername {
                username: draft.username().to_string(),
            });
        }

        let hashed = hash_password_blocking(
            Zeroizing::new(draft.password().to_string()),
            self.config.password.clone(),
        )
        .await?;

        let (key, wrapped_key) = wrap_key(&self.root_key)?;
        let blob_iv = generate_iv();
        let encrypted_blob = encrypt_account_blob(draft.profile(), &key, &blob_iv)?;
        drop(key);

        let now = self.clock.now();
        let record = AccountRecord {
            id: Uuid::new_v4().to_string(),
            username: draft.username().to_string(),
            password_hash: hashed.hash,
            password_salt: hashed.salt,
            encrypted_blob,
            wrapped_key,
            blob_iv: blob_iv.to_vec(),
            last_login: None,
            created_at: now,
            updated_at: now,
        };

        self.accounts.insert(&record).await?;
        tracing::info!(account_id = %record.id, "Account created");

        self.invalidate(&[], true).await;

        Ok(Account {
            id: record.id,
            username: record.username,
            profile: draft.profile().to_vec(),
            last_login: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies a patch to an existing account.
    ///
    /// The profile is re-encrypted under the account's existing data key
    /// with a new IV. The password is untouched.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidAccount` for an invalid patch,
    /// `AuthError::NotFound` for an unknown id, `AuthError::DuplicateUsername`
    /// if a rename collides, `AuthError::KeyUnwrap`/`AuthError::Decryption`
    /// if the stored record is corrupt, or a storage error.
    #[instrument(skip(self, patch))]
    pub async fn update_account(&self, id: &str, patch: AccountPatch) -> AuthResult<Account> {
        patch
            .validate()
            .map_err(|errors| AuthError::InvalidAccount { errors })?;

        let mut record = self.load_record(id).await?;
        let key = unwrap_key(&self.root_key, &record.wrapped_key)?;
        let current = self.open_with(&SealedAccount::from(&record), &key)?;
        let next = patch.apply(&current);

        let renamed = next.username != record.username;
        if renamed && self.accounts.username_exists(&next.username).await? {
            return Err(AuthError::DuplicateUsername {
                username: next.username,
            });
        }

        let blob_iv = generate_iv();
        record.encrypted_blob = encrypt_account_blob(&next.profile, &key, &blob_iv)?;
        record.blob_iv = blob_iv.to_vec();
        record.username = next.username.clone();
        record.updated_at = self.clock.now();
        drop(key);

        self.accounts.update(&record).await?;
        tracing::info!(account_id = %id, renamed, "Account updated");

        self.invalidate(&[CacheKey::account(id)], renamed).await;

        Ok(Account {
            updated_at: record.updated_at,
            ..next
        })
    }

    /// Replaces the password after checking the current one.
    ///
    /// Only the salt and hash change; the encrypted profile is untouched.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` if `current_password` is wrong,
    /// `AuthError::Validation` if the new password violates the policy,
    /// `AuthError::NotFound` for an unknown id, or a storage error.
    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        id: &str,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        validate_password(new_password, &self.config.password)
            .map_err(|e| AuthError::validation(e.to_string()))?;

        let mut record = self.load_record(id).await?;
        if !self.check_password(&record, current_password).await? {
            tracing::debug!(account_id = %id, "Password change rejected: wrong current password");
            return Err(AuthError::unauthorized("Invalid credentials"));
        }

        let hashed = hash_password_blocking(
            Zeroizing::new(new_password.to_string()),
            self.config.password.clone(),
        )
        .await?;
        record.password_hash = hashed.hash;
        record.password_salt = hashed.salt;
        record.updated_at = self.clock.now();

        self.accounts.update(&record).await?;
        tracing::info!(account_id = %id, "Password changed");

        self.invalidate(&[CacheKey::account(id)], false).await;
        Ok(())
    }

    /// Verifies a username and password and records the login.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` for an unknown username or wrong
    /// password (indistinguishable to the caller), or an integrity or
    /// storage error.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<Account> {
        let Some(record) = self.accounts.find_by_username(username).await? else {
            self.check_decoy(password).await?;
            tracing::debug!("Authentication failed: unknown username");
            return Err(AuthError::unauthorized("Invalid credentials"));
        };

        if !self.check_password(&record, password).await? {
            tracing::debug!(account_id = %record.id, "Authentication failed: wrong password");
            return Err(AuthError::unauthorized("Invalid credentials"));
        }

        let now = self.clock.now();
        self.accounts.update_last_login(&record.id, now).await?;
        self.invalidate(&[CacheKey::account(&record.id)], false).await;

        let mut account = self.open(&record)?;
        account.last_login = Some(now);
        tracing::debug!(account_id = %account.id, "Password authentication succeeded");
        Ok(account)
    }

    /// Returns the decrypted account, reading through the cache.
    ///
    /// # Errors
    ///
    /// Returns an integrity error if the record does not decrypt, or a
    /// storage error.
    pub async fn find_account(&self, id: &str) -> AuthResult<Option<Account>> {
        match self.cached_account(id).await {
            Ok(sealed) => {
                let key = unwrap_key(&self.root_key, &sealed.wrapped_key)?;
                self.open_with(&sealed, &key).map(Some)
            }
            Err(AuthError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the decrypted account.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotFound` for an unknown id, or the errors of
    /// [`find_account`](Self::find_account).
    pub async fn get_account(&self, id: &str) -> AuthResult<Account> {
        self.find_account(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("account {id}")))
    }

    /// Deletes an account with its username mapping, tokens and cache
    /// entries. Returns `true` if the account existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: &str) -> AuthResult<bool> {
        let revoked = self.tokens.delete_all_for_owner(id).await?;
        let deleted = self.accounts.delete(id).await?;
        if deleted {
            tracing::info!(account_id = %id, revoked_tokens = revoked, "Account deleted");
        }

        self.invalidate(&[CacheKey::account(id)], true).await;
        Ok(deleted)
    }

    /// Re-wraps an account's data key under `new_root`.
    ///
    /// The encrypted profile is untouched. Returns the updated record, which
    /// only opens under `new_root` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeyUnwrap` if the stored key does not open under
    /// the current root key, `AuthError::NotFound` for an unknown id, or a
    /// storage error.
    #[instrument(skip(self, new_root))]
    pub async fn rewrap_account_key(&self, id: &str, new_root: &RootKey) -> AuthResult<AccountRecord> {
        let mut record = self.load_record(id).await?;
        record.wrapped_key = rewrap_key(&self.root_key, new_root, &record.wrapped_key)?;
        record.updated_at = self.clock.now();

        self.accounts.update(&record).await?;
        self.invalidate(&[CacheKey::account(id)], false).await;
        tracing::info!(account_id = %id, "Account key re-wrapped");
        Ok(record)
    }

    /// Decrypts a record into the account view.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeyUnwrap` or `AuthError::Decryption` if the
    /// record was tampered with or the root key does not match.
    pub fn open(&self, record: &AccountRecord) -> AuthResult<Account> {
        let key = unwrap_key(&self.root_key, &record.wrapped_key)?;
        self.open_with(&SealedAccount::from(record), &key)
    }

    fn open_with(&self, sealed: &SealedAccount, key: &DataKey) -> AuthResult<Account> {
        let profile = decrypt_account_blob(&sealed.encrypted_blob, key, &sealed.blob_iv)?;
        Ok(Account {
            id: sealed.id.clone(),
            username: sealed.username.clone(),
            profile: profile.to_vec(),
            last_login: sealed.last_login,
            created_at: sealed.created_at,
            updated_at: sealed.updated_at,
        })
    }

    async fn check_password(&self, record: &AccountRecord, password: &str) -> AuthResult<bool> {
        verify_password_blocking(
            Zeroizing::new(password.to_string()),
            record.password_salt.clone(),
            record.password_hash.clone(),
            self.config.password.clone(),
        )
        .await
    }

    /// Burns one derivation against the decoy hash. The result is ignored.
    async fn check_decoy(&self, password: &str) -> AuthResult<()> {
        let decoy = self
            .decoy
            .get_or_try_init(|| decoy_password_blocking(self.config.password.clone()))
            .await?;

        verify_password_blocking(
            Zeroizing::new(password.to_string()),
            decoy.salt.clone(),
            decoy.hash.clone(),
            self.config.password.clone(),
        )
        .await?;
        Ok(())
    }

    /// Reads the authoritative record, bypassing the cache.
    async fn load_record(&self, id: &str) -> AuthResult<AccountRecord> {
        self.accounts
            .find_by_id(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("account {id}")))
    }

    async fn cached_account(&self, id: &str) -> AuthResult<SealedAccount> {
        let load = || async { Ok::<_, AuthError>(SealedAccount::from(&self.load_record(id).await?)) };
        match &self.cache {
            Some(cache) => cache.try_cache(&CacheKey::account(id), load).await,
            None => load().await,
        }
    }

    /// Drops point entries and, when the collection changed shape, every
    /// list entry. The store write has already committed, so failures are
    /// only logged.
    async fn invalidate(&self, keys: &[String], lists: bool) {
        let Some(cache) = &self.cache else {
            return;
        };
        for key in keys {
            if let Err(e) = cache.clear_cache(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to invalidate cache entry");
            }
        }
        if lists
            && let Err(e) = cache.clear_cache_prefix(CacheKey::ACCOUNT_LIST_PREFIX).await
        {
            tracing::warn!(error = %e, "Failed to invalidate account list cache");
        }
    }
}
