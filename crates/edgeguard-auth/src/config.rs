//! Credential, session, rate-limit and cache configuration.
//!
//! The configuration is built once at startup, validated, and then passed
//! by `Arc` into each service. Nothing here is process-global.
//!
//! # Example (TOML)
//!
//! ```toml
//! [secrets]
//! root_key = "base64-or-hex-32-bytes"
//! lookup_key = "base64-or-hex-32-bytes"
//!
//! [session]
//! session_lifetime = "30d"
//! api_token_lifetime = "365d"
//!
//! [rate_limiting.rules.login]
//! requests = 3
//! window = "1m"
//!
//! [cache]
//! ttl = "5m"
//! ```
//!
//! Every value can be overridden from the environment using the
//! `EDGEGUARD__SECTION__KEY` form, e.g. `EDGEGUARD__CACHE__TTL=30s`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::{RootKey, parse_key};
use crate::rate_limit::{RateLimitRule, RateLimitedOperation};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "EDGEGUARD";

/// Minimum accepted length for the admin secret.
pub const MIN_ADMIN_SECRET_LEN: usize = 16;

/// Root configuration for the credential and session core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Deployment secrets.
    pub secrets: SecretsConfig,

    /// Password policy and hashing cost.
    pub password: PasswordConfig,

    /// Session and API token lifetimes.
    pub session: SessionConfig,

    /// Per-operation request limits.
    pub rate_limiting: RateLimitingConfig,

    /// Cache-aside settings.
    pub cache: CacheConfig,
}

/// Deployment secrets, as encoded strings.
///
/// Keys are 32 bytes, hex or base64 encoded. They are supplied out-of-band
/// and never written to any store.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Key-encrypting key for account data keys.
    pub root_key: Option<String>,

    /// HMAC key for token lookup hashes.
    pub lookup_key: Option<String>,

    /// Static admin bearer value. Admin access is disabled when unset.
    pub admin_secret: Option<String>,
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("SecretsConfig")
            .field("root_key", &redact(&self.root_key))
            .field("lookup_key", &redact(&self.lookup_key))
            .field("admin_secret", &redact(&self.admin_secret))
            .finish()
    }
}

/// Decoded deployment secrets.
#[derive(Clone)]
pub struct Secrets {
    /// Key-encrypting key.
    pub root_key: RootKey,
    /// HMAC key for token lookup hashes.
    pub lookup_key: Zeroizing<Vec<u8>>,
    /// Static admin bearer value.
    pub admin_secret: Option<Zeroizing<String>>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("root_key", &self.root_key)
            .field("lookup_key", &"<redacted>")
            .field("admin_enabled", &self.admin_secret.is_some())
            .finish()
    }
}

impl SecretsConfig {
    /// Decodes the configured secrets.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the root or lookup key is absent and
    /// `ConfigError::InvalidValue` if either does not decode to 32 bytes.
    pub fn resolve(&self) -> Result<Secrets, ConfigError> {
        let root_key = self
            .root_key
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("secrets.root_key".to_string()))?;
        let lookup_key = self
            .lookup_key
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("secrets.lookup_key".to_string()))?;

        let root_key = RootKey::parse(root_key)
            .map_err(|e| ConfigError::InvalidValue(format!("secrets.root_key: {e}")))?;
        let lookup_key = parse_key(lookup_key)
            .map_err(|e| ConfigError::InvalidValue(format!("secrets.lookup_key: {e}")))?;

        Ok(Secrets {
            root_key,
            lookup_key: Zeroizing::new(lookup_key.to_vec()),
            admin_secret: self.admin_secret.clone().map(Zeroizing::new),
        })
    }
}

/// Password policy and Argon2id cost parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PasswordConfig {
    /// Minimum password length in characters.
    pub min_length: usize,

    /// Maximum password length in characters.
    pub max_length: usize,

    /// Argon2 memory cost in KiB.
    pub memory_kib: u32,

    /// Argon2 iteration count.
    pub iterations: u32,

    /// Argon2 lanes.
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 100,
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Token lifetimes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of login sessions.
    #[serde(with = "humantime_serde")]
    pub session_lifetime: Duration,

    /// Lifetime of explicitly issued API tokens.
    #[serde(with = "humantime_serde")]
    pub api_token_lifetime: Duration,

    /// Keep a sealed copy of each raw token so API tokens can be revealed
    /// again by their owner.
    pub store_encrypted_token: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_lifetime: Duration::from_secs(30 * 24 * 3600), // 30 days
            api_token_lifetime: Duration::from_secs(365 * 24 * 3600), // 1 year
            store_encrypted_token: true,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// When disabled every check is allowed without touching the store.
    pub enabled: bool,

    /// Overrides of the built-in rule table, keyed by operation name.
    pub rules: BTreeMap<String, RateLimitRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: BTreeMap::new(),
        }
    }
}

impl RateLimitingConfig {
    /// Returns the effective rule for `operation`.
    #[must_use]
    pub fn rule_for(&self, operation: RateLimitedOperation) -> RateLimitRule {
        self.rules
            .get(operation.as_str())
            .copied()
            .unwrap_or_else(|| operation.default_rule())
    }
}

/// Cache-aside configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When disabled reads always go to the loader.
    pub enabled: bool,

    /// Age after which a cached entry is considered stale.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration sources could not be read or merged.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl AuthConfig {
    /// Loads configuration from an optional TOML file plus `EDGEGUARD__*`
    /// environment overrides, then validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` if a source cannot be read or does not
    /// deserialize, and any error from [`AuthConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        // Environment variable overrides, e.g. EDGEGUARD__CACHE__TTL=30s
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );

        let merged: Self = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;

        merged.validate()?;
        Ok(merged)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - A configured secret does not decode to 32 bytes
    /// - The admin secret is shorter than 16 characters
    /// - The password bounds are empty or below 8 characters
    /// - A token lifetime or the cache TTL is zero
    /// - A rate-limit override names an unknown operation or allows nothing
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate secrets that are present
        if let Some(root_key) = &self.secrets.root_key {
            parse_key(root_key)
                .map_err(|e| ConfigError::InvalidValue(format!("secrets.root_key: {e}")))?;
        }
        if let Some(lookup_key) = &self.secrets.lookup_key {
            parse_key(lookup_key)
                .map_err(|e| ConfigError::InvalidValue(format!("secrets.lookup_key: {e}")))?;
        }
        if let Some(admin) = &self.secrets.admin_secret
            && admin.chars().count() < MIN_ADMIN_SECRET_LEN
        {
            return Err(ConfigError::InvalidValue(format!(
                "secrets.admin_secret must be at least {MIN_ADMIN_SECRET_LEN} characters"
            )));
        }

        // Validate password policy
        if self.password.min_length < 8 {
            return Err(ConfigError::InvalidValue(
                "password.min_length must be >= 8".to_string(),
            ));
        }
        if self.password.max_length < self.password.min_length {
            return Err(ConfigError::InvalidValue(format!(
                "password.max_length ({}) must be >= password.min_length ({})",
                self.password.max_length, self.password.min_length
            )));
        }
        if self.password.iterations == 0 || self.password.parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "password.iterations and password.parallelism must be > 0".to_string(),
            ));
        }
        if self.password.memory_kib < 8 * self.password.parallelism {
            return Err(ConfigError::InvalidValue(
                "password.memory_kib must be at least 8 * parallelism".to_string(),
            ));
        }

        // Validate lifetimes
        if self.session.session_lifetime.is_zero() || self.session.api_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session lifetimes must be > 0".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::InvalidValue("cache.ttl must be > 0".to_string()));
        }

        // Validate rate limit overrides
        for (name, rule) in &self.rate_limiting.rules {
            if RateLimitedOperation::from_name(name).is_none() {
                return Err(ConfigError::InvalidValue(format!(
                    "Unknown rate-limited operation: '{name}'"
                )));
            }
            if rule.requests == 0 || rule.window.is_zero() {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limiting.rules.{name} must allow at least one request per non-empty window"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_default_config_validates() {
        let config = AuthConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.password.min_length, 8);
        assert_eq!(config.password.max_length, 100);
        assert_eq!(
            config.session.session_lifetime,
            Duration::from_secs(30 * 24 * 3600)
        );
    }

    #[test]
    fn test_invalid_password_bounds() {
        let mut config = AuthConfig::default();
        config.password.max_length = 4;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_short_admin_secret_rejected() {
        let mut config = AuthConfig::default();
        config.secrets.admin_secret = Some("short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_rate_limit_operation_rejected() {
        let mut config = AuthConfig::default();
        config.rate_limiting.rules.insert(
            "teleport".to_string(),
            RateLimitRule::new(1, Duration::from_secs(60)),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_rule_override() {
        let mut config = AuthConfig::default();
        config.rate_limiting.rules.insert(
            "login".to_string(),
            RateLimitRule::new(10, Duration::from_secs(30)),
        );
        let rule = config.rate_limiting.rule_for(RateLimitedOperation::Login);
        assert_eq!(rule.requests, 10);

        let rule = config
            .rate_limiting
            .rule_for(RateLimitedOperation::AccountCreation);
        assert_eq!(rule.requests, 5);
        assert_eq!(rule.window, Duration::from_secs(300));
    }

    #[test]
    fn test_resolve_secrets() {
        let secrets = SecretsConfig {
            root_key: Some(HEX_KEY.to_string()),
            lookup_key: Some(HEX_KEY.to_string()),
            admin_secret: None,
        };
        let resolved = secrets.resolve().unwrap();
        assert_eq!(resolved.lookup_key.len(), 32);
        assert!(resolved.admin_secret.is_none());

        let missing = SecretsConfig::default().resolve().unwrap_err();
        assert!(matches!(missing, ConfigError::Missing(_)));
    }

    #[test]
    fn test_secrets_debug_is_redacted() {
        let secrets = SecretsConfig {
            root_key: Some(HEX_KEY.to_string()),
            lookup_key: None,
            admin_secret: Some("super-secret-admin-value".to_string()),
        };
        let debug = format!("{secrets:?}");
        assert!(!debug.contains(HEX_KEY));
        assert!(!debug.contains("super-secret-admin-value"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[secrets]
root_key = "{HEX_KEY}"
lookup_key = "{HEX_KEY}"

[session]
session_lifetime = "7d"

[rate_limiting.rules.login]
requests = 10
window = "2m"

[cache]
ttl = "30s"
"#
        )
        .unwrap();

        let config = AuthConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.session.session_lifetime,
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        let login = config.rate_limiting.rule_for(RateLimitedOperation::Login);
        assert_eq!(login.requests, 10);
        assert_eq!(login.window, Duration::from_secs(120));
        assert!(config.secrets.resolve().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AuthConfig::load(Some(Path::new("/nonexistent/edgeguard.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
