//! Credential and session error types.
//!
//! Every fallible operation in this crate returns [`AuthError`]. Mapping an
//! error to a transport response is left to the caller; [`AuthError::status_code`]
//! only names the status the taxonomy corresponds to.

use std::fmt;
use std::time::Duration;

use crate::account::AccountValidationError;

/// Errors that can occur while handling credentials, sessions, rate limits
/// and cached reads.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request carried malformed or unacceptable input.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// An account draft failed builder validation.
    #[error("Invalid account: {}", join_errors(.errors))]
    InvalidAccount {
        /// Every problem found in the draft.
        errors: Vec<AccountValidationError>,
    },

    /// The username was taken between the uniqueness check and the insert.
    ///
    /// Callers should treat this as a validation error and may retry.
    #[error("Username already taken: {username}")]
    DuplicateUsername {
        /// The contested username.
        username: String,
    },

    /// Missing or invalid credentials.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of why authentication failed.
        message: String,
    },

    /// The caller is authenticated but lacks the rights for this operation.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of why access is forbidden.
        message: String,
    },

    /// The requested record does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// Description of the missing record.
        message: String,
    },

    /// The bearer token exists but its expiry has passed.
    #[error("Token expired")]
    TokenExpired,

    /// A wrapped data key failed authentication under the root key.
    #[error("Key unwrap failed")]
    KeyUnwrap,

    /// An encrypted blob failed authentication under its data key.
    #[error("Decryption failed")]
    Decryption,

    /// The caller exceeded a rate limit.
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// A backing store could not be reached.
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the store failure.
        message: String,
    },

    /// A backing store rejected or failed an operation.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

fn join_errors(errors: &[AccountValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AuthError {
    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a new `StoreUnavailable` error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::InvalidAccount { .. }
                | Self::DuplicateUsername { .. }
                | Self::Unauthorized { .. }
                | Self::Forbidden { .. }
                | Self::NotFound { .. }
                | Self::TokenExpired
                | Self::RateLimited { .. }
        )
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::KeyUnwrap
                | Self::Decryption
                | Self::StoreUnavailable { .. }
                | Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns `true` if this is an authentication error.
    #[must_use]
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::TokenExpired)
    }

    /// Returns `true` if the caller may repeat the same request and expect
    /// a different outcome.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateUsername { .. } | Self::RateLimited { .. }
        )
    }

    /// Returns `true` if this error signals corrupted ciphertext or a root
    /// key mismatch.
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::KeyUnwrap | Self::Decryption)
    }

    /// Returns the HTTP status this error corresponds to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::InvalidAccount { .. } | Self::DuplicateUsername { .. } => {
                400
            }
            Self::Unauthorized { .. } | Self::TokenExpired => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::RateLimited { .. } => 429,
            Self::KeyUnwrap
            | Self::Decryption
            | Self::StoreUnavailable { .. }
            | Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Returns a message safe to show to a remote caller.
    ///
    /// Server-side failures collapse to a generic message so that store
    /// details and key material never leave the process.
    #[must_use]
    pub fn public_message(&self) -> String {
        if self.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::InvalidAccount { .. } => ErrorCategory::Validation,
            Self::DuplicateUsername { .. } => ErrorCategory::Validation,
            Self::Unauthorized { .. } => ErrorCategory::Authentication,
            Self::Forbidden { .. } => ErrorCategory::Authorization,
            Self::NotFound { .. } => ErrorCategory::Validation,
            Self::TokenExpired => ErrorCategory::Token,
            Self::KeyUnwrap => ErrorCategory::Crypto,
            Self::Decryption => ErrorCategory::Crypto,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::StoreUnavailable { .. } => ErrorCategory::Infrastructure,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Identity verification failures.
    Authentication,
    /// Permission failures.
    Authorization,
    /// Token lifecycle failures.
    Token,
    /// Rejected input.
    Validation,
    /// Key unwrap and decryption failures.
    Crypto,
    /// Throttled callers.
    RateLimit,
    /// Store failures.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::Token => write!(f, "token"),
            Self::Validation => write!(f, "validation"),
            Self::Crypto => write!(f, "crypto"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
