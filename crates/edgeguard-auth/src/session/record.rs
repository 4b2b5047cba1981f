//! Token record domain types.
//!
//! # Security
//!
//! - The raw token is returned to the caller once and never stored in clear
//! - `lookup_hash` is a keyed HMAC so the index reveals nothing without the key
//! - `token_hash` is a salted SHA-256 verifier compared in constant time

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Created by a login; revocable by "log out everywhere".
    Session,
    /// Explicitly issued, longer-lived credential.
    Api,
}

impl TokenKind {
    /// Raw token prefix for this kind.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Session => "egs_",
            Self::Api => "ega_",
        }
    }
}

/// Token record stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Unique identifier, safe to show and log.
    pub id: String,

    /// Account the token authenticates as.
    pub owner_id: String,

    /// Raw token sealed under the root key, kept only when reveal is enabled.
    pub encrypted_token: Option<Vec<u8>>,

    /// Hex SHA-256 of `salt || token`.
    pub token_hash: String,

    /// Hex HMAC-SHA256 of the token under the lookup key. Unique.
    pub lookup_hash: String,

    /// Hex salt for `token_hash`.
    pub salt: String,

    /// `true` for login sessions, `false` for API tokens.
    pub is_session: bool,

    /// When the token was issued.
    pub created_at: OffsetDateTime,

    /// When the token stops verifying.
    pub expires_at: OffsetDateTime,
}

impl TokenRecord {
    /// Returns the token kind.
    #[must_use]
    pub fn kind(&self) -> TokenKind {
        if self.is_session {
            TokenKind::Session
        } else {
            TokenKind::Api
        }
    }

    /// Returns `true` once `now` is strictly past `expires_at`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Returns the non-secret view of this record.
    #[must_use]
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id.clone(),
            kind: self.kind(),
            revealable: self.encrypted_token.is_some(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Non-secret description of a token, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    /// Token id.
    pub id: String,
    /// Token kind.
    pub kind: TokenKind,
    /// Whether the raw value can be revealed again.
    pub revealable: bool,
    /// When the token was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the token expires.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// A freshly issued token.
///
/// This is the only time the raw value is available.
#[derive(Clone)]
pub struct IssuedToken {
    /// Raw bearer value.
    pub token: String,
    /// Token id.
    pub id: String,
    /// When the token expires.
    pub expires_at: OffsetDateTime,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_expiry_is_strict() {
        let expires_at = datetime!(2024-02-01 00:00 UTC);
        let record = TokenRecord {
            id: "t1".into(),
            owner_id: "u1".into(),
            encrypted_token: None,
            token_hash: String::new(),
            lookup_hash: String::new(),
            salt: String::new(),
            is_session: true,
            created_at: datetime!(2024-01-01 00:00 UTC),
            expires_at,
        };

        assert!(!record.is_expired_at(expires_at));
        assert!(record.is_expired_at(expires_at + time::Duration::milliseconds(1)));
        assert_eq!(record.kind(), TokenKind::Session);
        assert!(!record.summary().revealable);
    }

    #[test]
    fn test_issued_token_debug_is_redacted() {
        let issued = IssuedToken {
            token: "egs_secret".into(),
            id: "t1".into(),
            expires_at: datetime!(2024-02-01 00:00 UTC),
        };
        assert!(!format!("{issued:?}").contains("egs_secret"));
    }
}
