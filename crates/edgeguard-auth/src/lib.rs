//! # edgeguard-auth
//!
//! Credential security and session core for the Edgeguard API backend.
//!
//! This crate provides:
//! - Envelope encryption of account data under per-record keys
//! - Argon2id password hashing and encrypted account records
//! - Session and API bearer tokens with lookup-hash retrieval
//! - Fixed-window rate limiting that fails open on store outages
//! - A cache-aside helper with timestamp freshness
//!
//! ## Overview
//!
//! An inbound request first passes the [`rate_limit::RateLimiter`]. The
//! [`session::SessionService`] then authenticates it: Basic credentials go
//! through the [`credentials::CredentialStore`] password check, bearer
//! tokens through a lookup-hash fetch, an expiry check and a constant-time
//! verifier comparison. The resolved account is decrypted with
//! [`keys`] and may be served from the [`cache::CacheLayer`].
//!
//! ## Modules
//!
//! - [`config`] - Configuration and loading
//! - [`keys`] - Root and data keys, key wrapping, sealing
//! - [`credentials`] - Password hashing and the credential store
//! - [`session`] - Token issuance, verification and revocation
//! - [`rate_limit`] - Request counters and the per-operation rule table
//! - [`cache`] - Cache-aside helper
//! - [`storage`] - Storage traits and in-memory backends
//! - [`services`] - Wiring of all services from one configuration

pub mod account;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod rate_limit;
pub mod services;
pub mod session;
pub mod storage;

pub use account::{Account, AccountBuilder, AccountPatch, AccountRecord, AccountValidationError};
pub use cache::{CacheKey, CacheLayer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ConfigError, Secrets};
pub use credentials::CredentialStore;
pub use error::{AuthError, ErrorCategory};
pub use keys::{DataKey, RootKey, WrappedKey};
pub use rate_limit::{RateLimitDecision, RateLimitRule, RateLimitedOperation, RateLimiter};
pub use services::AuthServices;
pub use session::{IssuedToken, Principal, SessionService, TokenKind, TokenRecord, TokenSummary};
pub use storage::{AccountStorage, KvError, KvStore, TokenStorage};

/// Type alias for credential and session results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use edgeguard_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::account::{Account, AccountBuilder, AccountPatch};
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::rate_limit::{RateLimitedOperation, client_identifier};
    pub use crate::services::AuthServices;
    pub use crate::session::{IssuedToken, Principal};
    pub use crate::storage::{AccountStorage, KvStore, TokenStorage};
}
