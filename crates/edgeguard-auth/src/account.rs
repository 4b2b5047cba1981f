//! Account records, drafts and patches.
//!
//! The domain account itself is opaque to this crate: it arrives as a
//! serialized byte blob ("profile") produced by the domain library and is
//! only ever stored encrypted.
//!
//! - [`AccountRecord`] is the persisted row: hashes, wrapped key, ciphertext.
//! - [`Account`] is the decrypted view handed to callers.
//! - [`AccountBuilder`] collects a new account and validates it in one step.
//! - [`AccountPatch`] describes a partial update applied copy-on-write.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::config::PasswordConfig;
use crate::keys::{WrappedKey, hex_bytes};

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 64;

/// Persisted account secret record.
///
/// Never contains plaintext: the profile is AES-GCM encrypted under a
/// per-record data key, and that key is stored only in wrapped form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Unique identifier.
    pub id: String,

    /// Globally unique login name.
    pub username: String,

    /// Argon2id digest of the password.
    #[serde(with = "hex_bytes")]
    pub password_hash: Vec<u8>,

    /// Salt used for the password digest.
    #[serde(with = "hex_bytes")]
    pub password_salt: Vec<u8>,

    /// Ciphertext of the serialized domain account.
    #[serde(with = "hex_bytes")]
    pub encrypted_blob: Vec<u8>,

    /// Data key wrapped under the root key.
    pub wrapped_key: WrappedKey,

    /// Nonce used for `encrypted_blob`; fresh on every write.
    #[serde(with = "hex_bytes")]
    pub blob_iv: Vec<u8>,

    /// Last successful password authentication.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,

    /// When the record was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the record was last modified.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Decrypted account view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Unique identifier.
    pub id: String,
    /// Login name.
    pub username: String,
    /// Serialized domain account.
    pub profile: Vec<u8>,
    /// Last successful password authentication.
    pub last_login: Option<OffsetDateTime>,
    /// When the account was created.
    pub created_at: OffsetDateTime,
    /// When the account was last modified.
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Validation
// =============================================================================

/// A problem found while validating an account draft or patch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountValidationError {
    /// No username was given.
    #[error("username is required")]
    UsernameMissing,

    /// The username is longer than allowed.
    #[error("username must be at most {max} characters")]
    UsernameTooLong {
        /// Maximum length.
        max: usize,
    },

    /// The username contains a colon, whitespace or a control character.
    #[error("username must not contain ':', whitespace or control characters")]
    UsernameInvalidCharacters,

    /// No password was given.
    #[error("password is required")]
    PasswordMissing,

    /// The password is shorter than the policy minimum.
    #[error("password must be at least {min} characters")]
    PasswordTooShort {
        /// Minimum length.
        min: usize,
    },

    /// The password is longer than the policy maximum.
    #[error("password must be at most {max} characters")]
    PasswordTooLong {
        /// Maximum length.
        max: usize,
    },
}

/// Checks a username against the naming rules.
///
/// Colons are rejected because Basic credentials split on the first colon.
pub fn validate_username(username: &str) -> Result<(), AccountValidationError> {
    if username.is_empty() {
        return Err(AccountValidationError::UsernameMissing);
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AccountValidationError::UsernameTooLong {
            max: MAX_USERNAME_LEN,
        });
    }
    if username
        .chars()
        .any(|c| c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(AccountValidationError::UsernameInvalidCharacters);
    }
    Ok(())
}

/// Checks a password against the length policy, counting characters.
pub fn validate_password(
    password: &str,
    policy: &PasswordConfig,
) -> Result<(), AccountValidationError> {
    let len = password.chars().count();
    if len < policy.min_length {
        return Err(AccountValidationError::PasswordTooShort {
            min: policy.min_length,
        });
    }
    if len > policy.max_length {
        return Err(AccountValidationError::PasswordTooLong {
            max: policy.max_length,
        });
    }
    Ok(())
}

// =============================================================================
// Builder
// =============================================================================

/// Mutable draft of a new account.
///
/// ```
/// use edgeguard_auth::account::AccountBuilder;
/// use edgeguard_auth::config::PasswordConfig;
///
/// let draft = AccountBuilder::new()
///     .username("alice")
///     .password("correcthorse1")
///     .profile(b"{}".to_vec())
///     .validate(&PasswordConfig::default())
///     .unwrap();
/// assert_eq!(draft.username(), "alice");
/// ```
#[derive(Default)]
pub struct AccountBuilder {
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    profile: Vec<u8>,
}

impl AccountBuilder {
    /// Creates an empty draft.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the login name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the initial password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Sets the serialized domain account.
    #[must_use]
    pub fn profile(mut self, profile: Vec<u8>) -> Self {
        self.profile = profile;
        self
    }

    /// Validates the draft, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns all validation failures found in the draft.
    pub fn validate(self, policy: &PasswordConfig) -> Result<NewAccount, Vec<AccountValidationError>> {
        let mut errors = Vec::new();

        let username = self.username.unwrap_or_default();
        if let Err(e) = validate_username(&username) {
            errors.push(e);
        }

        match &self.password {
            None => errors.push(AccountValidationError::PasswordMissing),
            Some(password) => {
                if let Err(e) = validate_password(password, policy) {
                    errors.push(e);
                }
            }
        }

        match self.password {
            Some(password) if errors.is_empty() => Ok(NewAccount {
                username,
                password,
                profile: self.profile,
            }),
            _ => Err(errors),
        }
    }
}

impl fmt::Debug for AccountBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountBuilder")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("profile_len", &self.profile.len())
            .finish()
    }
}

/// A validated account draft, ready to be saved.
pub struct NewAccount {
    username: String,
    password: Zeroizing<String>,
    profile: Vec<u8>,
}

impl NewAccount {
    /// Login name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Serialized domain account.
    #[must_use]
    pub fn profile(&self) -> &[u8] {
        &self.profile
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("profile_len", &self.profile.len())
            .finish()
    }
}

// =============================================================================
// Patch
// =============================================================================

/// Partial update of an account.
///
/// Omitted fields keep their existing value. Applying a patch never mutates
/// the input; it produces a new [`Account`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPatch {
    /// New login name.
    pub username: Option<String>,
    /// New serialized domain account.
    pub profile: Option<Vec<u8>>,
}

impl AccountPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the login name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Replaces the serialized domain account.
    #[must_use]
    pub fn profile(mut self, profile: Vec<u8>) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.profile.is_none()
    }

    /// Validates the fields present in the patch.
    ///
    /// # Errors
    ///
    /// Returns all validation failures found in the patch.
    pub fn validate(&self) -> Result<(), Vec<AccountValidationError>> {
        match &self.username {
            Some(username) => validate_username(username).map_err(|e| vec![e]),
            None => Ok(()),
        }
    }

    /// Produces the patched account. `updated_at` is left to the caller.
    #[must_use]
    pub fn apply(&self, current: &Account) -> Account {
        Account {
            id: current.id.clone(),
            username: self
                .username
                .clone()
                .unwrap_or_else(|| current.username.clone()),
            profile: self
                .profile
                .clone()
                .unwrap_or_else(|| current.profile.clone()),
            last_login: current.last_login,
            created_at: current.created_at,
            updated_at: current.updated_at,
        }
    }
}
