//! Session and API token issuance, verification and revocation.
//!
//! # Token lifecycle
//!
//! ```text
//! issued -> active -> revoked   (explicit deletion)
//!                  -> expired   (now > expires_at, checked lazily)
//! ```
//!
//! Both end states are terminal. A token is never reactivated and no
//! background job sweeps expired rows on the request path.
//!
//! # Verification
//!
//! 1. Compare against the admin secret (constant time)
//! 2. Compute the keyed lookup hash and fetch the single matching record
//! 3. Reject if `now > expires_at`
//! 4. Compare the salted verifier (constant time)
//! 5. Resolve the owning account through the credential store

mod header;
mod record;

use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;
use zeroize::Zeroizing;

pub use header::{Credentials, parse_authorization, parse_basic};
pub use record::{IssuedToken, TokenKind, TokenRecord, TokenSummary};

use crate::AuthResult;
use crate::account::Account;
use crate::clock::Clock;
use crate::config::{AuthConfig, Secrets};
use crate::credentials::CredentialStore;
use crate::crypto::{
    constant_time_eq, constant_time_str_eq, generate_salt, generate_token, lookup_hash,
    token_verifier,
};
use crate::error::AuthError;
use crate::keys::{RootKey, open, seal};
use crate::storage::TokenStorage;

/// Identifier reported for the admin principal.
pub const ADMIN_PRINCIPAL_ID: &str = "admin";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// The static admin secret. Has no backing account.
    Admin,
    /// A regular account.
    Account(Account),
}

impl Principal {
    /// Returns `true` for the admin principal.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Returns the account, if any.
    #[must_use]
    pub fn account(&self) -> Option<&Account> {
        match self {
            Self::Admin => None,
            Self::Account(account) => Some(account),
        }
    }

    /// Returns the principal id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Admin => ADMIN_PRINCIPAL_ID,
            Self::Account(account) => &account.id,
        }
    }
}

/// Issues and verifies bearer tokens and resolves Basic logins.
pub struct SessionService {
    credentials: Arc<CredentialStore>,
    tokens: Arc<dyn TokenStorage>,
    config: Arc<AuthConfig>,
    root_key: RootKey,
    lookup_key: Zeroizing<Vec<u8>>,
    admin_secret: Option<Zeroizing<String>>,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    /// Creates a session service.
    pub fn new(
        credentials: Arc<CredentialStore>,
        tokens: Arc<dyn TokenStorage>,
        config: Arc<AuthConfig>,
        secrets: &Secrets,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credentials,
            tokens,
            config,
            root_key: secrets.root_key.clone(),
            lookup_key: secrets.lookup_key.clone(),
            admin_secret: secrets.admin_secret.clone(),
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Issuance
    // -------------------------------------------------------------------------

    /// Issues a login session for `owner_id`.
    ///
    /// The raw token is returned exactly once.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be persisted.
    pub async fn issue_session(&self, owner_id: &str) -> AuthResult<IssuedToken> {
        self.issue(owner_id, TokenKind::Session).await
    }

    /// Issues a longer-lived API token for `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be persisted.
    pub async fn issue_api_token(&self, owner_id: &str) -> AuthResult<IssuedToken> {
        self.issue(owner_id, TokenKind::Api).await
    }

    #[instrument(skip(self))]
    async fn issue(&self, owner_id: &str, kind: TokenKind) -> AuthResult<IssuedToken> {
        let lifetime = match kind {
            TokenKind::Session => self.config.session.session_lifetime,
            TokenKind::Api => self.config.session.api_token_lifetime,
        };

        let id = Uuid::new_v4().to_string();
        let token = Zeroizing::new(generate_token(kind.prefix()));
        let salt = generate_salt();

        let encrypted_token = if self.config.session.store_encrypted_token {
            Some(seal(&self.root_key, token.as_bytes(), id.as_bytes())?)
        } else {
            None
        };

        let now = self.clock.now();
        let record = TokenRecord {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            encrypted_token,
            token_hash: token_verifier(&salt, &token),
            lookup_hash: lookup_hash(&self.lookup_key, &token)?,
            salt: hex::encode(salt),
            is_session: kind == TokenKind::Session,
            created_at: now,
            expires_at: now + lifetime,
        };

        self.tokens.insert(&record).await?;
        tracing::info!(token_id = %id, owner_id, kind = ?kind, "Token issued");

        Ok(IssuedToken {
            token: token.to_string(),
            id,
            expires_at: record.expires_at,
        })
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Authenticates an `Authorization` header of either scheme.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` or `AuthError::TokenExpired` for bad
    /// credentials, or an integrity or storage error.
    pub async fn authenticate(&self, header: &str) -> AuthResult<Principal> {
        match parse_authorization(header)? {
            Credentials::Basic { username, password } => self
                .credentials
                .authenticate(&username, &password)
                .await
                .map(Principal::Account),
            Credentials::Bearer(token) => self.verify_bearer(&token).await,
        }
    }

    /// Verifies a bearer value and resolves its owner.
    ///
    /// The admin secret authenticates as [`Principal::Admin`].
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` for an unknown or mismatching token
    /// or a deleted owner, `AuthError::TokenExpired` for an expired one, or
    /// an integrity or storage error.
    pub async fn verify_bearer(&self, token: &str) -> AuthResult<Principal> {
        if self.is_admin_secret(token) {
            tracing::debug!("Admin bearer accepted");
            return Ok(Principal::Admin);
        }

        let record = self.verify_token(token).await?;
        match self.credentials.find_account(&record.owner_id).await? {
            Some(account) => Ok(Principal::Account(account)),
            None => {
                tracing::debug!(token_id = %record.id, "Token owner no longer exists");
                Err(AuthError::unauthorized("Invalid token"))
            }
        }
    }

    /// Verifies a raw token and returns its record without resolving the
    /// owner.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` for an unknown or mismatching token,
    /// `AuthError::TokenExpired` for an expired one, or a storage error.
    pub async fn verify_token(&self, token: &str) -> AuthResult<TokenRecord> {
        let lookup = lookup_hash(&self.lookup_key, token)?;
        let Some(record) = self.tokens.find_by_lookup_hash(&lookup).await? else {
            tracing::debug!("Bearer rejected: unknown token");
            return Err(AuthError::unauthorized("Invalid token"));
        };

        if record.is_expired_at(self.clock.now()) {
            tracing::debug!(token_id = %record.id, "Bearer rejected: expired");
            return Err(AuthError::TokenExpired);
        }

        let salt = hex::decode(&record.salt)
            .map_err(|_| AuthError::internal(format!("token {} has a malformed salt", record.id)))?;
        let candidate = token_verifier(&salt, token);
        if !constant_time_eq(candidate.as_bytes(), record.token_hash.as_bytes()) {
            tracing::debug!(token_id = %record.id, "Bearer rejected: verifier mismatch");
            return Err(AuthError::unauthorized("Invalid token"));
        }

        Ok(record)
    }

    /// Verifies a `Basic` header against the credential store.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthorized` for a malformed header or wrong
    /// credentials, or an integrity or storage error.
    pub async fn verify_basic(&self, header: &str) -> AuthResult<Account> {
        let (username, password) = parse_basic(header)?;
        self.credentials.authenticate(&username, &password).await
    }

    /// Verifies a `Basic` header and opens a new session.
    ///
    /// Every call creates an independent session; concurrent logins from
    /// several devices all stay valid.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`verify_basic`](Self::verify_basic) or a storage
    /// error from issuance.
    pub async fn login(&self, header: &str) -> AuthResult<(Account, IssuedToken)> {
        let account = self.verify_basic(header).await?;
        let issued = self.issue_session(&account.id).await?;
        Ok((account, issued))
    }

    fn is_admin_secret(&self, token: &str) -> bool {
        self.admin_secret
            .as_ref()
            .is_some_and(|secret| constant_time_str_eq(secret, token))
    }

    // -------------------------------------------------------------------------
    // Revocation and listing
    // -------------------------------------------------------------------------

    /// Revokes the token with this raw value. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn revoke(&self, token: &str) -> AuthResult<bool> {
        let lookup = lookup_hash(&self.lookup_key, token)?;
        let revoked = self.tokens.delete_by_lookup_hash(&lookup).await?;
        if revoked {
            tracing::info!("Token revoked");
        }
        Ok(revoked)
    }

    /// Revokes one of `owner_id`'s tokens by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[instrument(skip(self))]
    pub async fn revoke_by_id(&self, owner_id: &str, token_id: &str) -> AuthResult<bool> {
        let revoked = self.tokens.delete_by_id(owner_id, token_id).await?;
        if revoked {
            tracing::info!("Token revoked");
        }
        Ok(revoked)
    }

    /// Revokes every session of `owner_id`. API tokens are kept.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[instrument(skip(self))]
    pub async fn revoke_all_sessions(&self, owner_id: &str) -> AuthResult<u64> {
        let revoked = self.tokens.delete_sessions_for_owner(owner_id).await?;
        tracing::info!(revoked, "Sessions revoked");
        Ok(revoked)
    }

    /// Lists `owner_id`'s tokens without secrets, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_tokens(&self, owner_id: &str) -> AuthResult<Vec<TokenSummary>> {
        let records = self.tokens.list_for_owner(owner_id).await?;
        Ok(records.iter().map(TokenRecord::summary).collect())
    }

    /// Returns the raw value of one of `owner_id`'s API tokens.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotFound` if the token does not exist or no
    /// sealed copy was stored, `AuthError::Forbidden` for session tokens,
    /// `AuthError::TokenExpired` for expired tokens, or
    /// `AuthError::Decryption` if the sealed copy is corrupt.
    #[instrument(skip(self))]
    pub async fn reveal_token(&self, owner_id: &str, token_id: &str) -> AuthResult<Zeroizing<String>> {
        let record = self
            .tokens
            .find_by_id(owner_id, token_id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("token {token_id}")))?;

        if record.is_session {
            return Err(AuthError::forbidden("Session tokens cannot be revealed"));
        }
        if record.is_expired_at(self.clock.now()) {
            return Err(AuthError::TokenExpired);
        }
        let sealed = record
            .encrypted_token
            .as_deref()
            .ok_or_else(|| AuthError::not_found(format!("no stored copy of token {token_id}")))?;

        let raw = open(&self.root_key, sealed, record.id.as_bytes())?;
        let token = String::from_utf8(raw.to_vec()).map_err(|_| AuthError::Decryption)?;
        tracing::info!("Token revealed");
        Ok(Zeroizing::new(token))
    }

    /// Deletes expired token rows. Returns the number deleted.
    ///
    /// Expired tokens are already rejected at verification; this only
    /// reclaims storage and is meant for operator tooling.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn purge_expired(&self) -> AuthResult<u64> {
        let purged = self.tokens.delete_expired(self.clock.now()).await?;
        tracing::info!(purged, "Expired tokens purged");
        Ok(purged)
    }
}
