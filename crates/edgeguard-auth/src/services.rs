//! Wiring of the credential, session, rate-limit and cache services.

use std::sync::Arc;

use crate::cache::CacheLayer;
use crate::clock::{Clock, SystemClock};
use crate::config::{AuthConfig, ConfigError};
use crate::credentials::CredentialStore;
use crate::rate_limit::RateLimiter;
use crate::session::SessionService;
use crate::storage::{AccountStorage, KvStore, TokenStorage};

/// All services built from one configuration.
///
/// Construct once at startup and share by `Arc`; every field is itself
/// cheap to share.
pub struct AuthServices {
    /// Shared configuration.
    pub config: Arc<AuthConfig>,
    /// Account persistence.
    pub credentials: Arc<CredentialStore>,
    /// Token issuance and verification.
    pub sessions: Arc<SessionService>,
    /// Request throttling.
    pub rate_limiter: Arc<RateLimiter>,
    /// Cache-aside helper for higher-level read paths.
    pub cache: Arc<CacheLayer>,
}

impl AuthServices {
    /// Builds every service on the system clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or the
    /// secrets are missing.
    pub fn new(
        config: AuthConfig,
        accounts: Arc<dyn AccountStorage>,
        tokens: Arc<dyn TokenStorage>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, accounts, tokens, kv, Arc::new(SystemClock))
    }

    /// Builds every service on the given clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or the
    /// secrets are missing.
    pub fn with_clock(
        config: AuthConfig,
        accounts: Arc<dyn AccountStorage>,
        tokens: Arc<dyn TokenStorage>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let secrets = config.secrets.resolve()?;
        let config = Arc::new(config);

        let cache = Arc::new(CacheLayer::new(kv.clone(), &config.cache, clock.clone()));
        let credentials = Arc::new(
            CredentialStore::new(
                accounts,
                tokens.clone(),
                config.clone(),
                secrets.root_key.clone(),
                clock.clone(),
            )
            .with_cache(cache.clone()),
        );
        let sessions = Arc::new(SessionService::new(
            credentials.clone(),
            tokens,
            config.clone(),
            &secrets,
            clock.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(kv, config.clone(), clock));

        tracing::debug!(
            cache_enabled = config.cache.enabled,
            rate_limiting_enabled = config.rate_limiting.enabled,
            admin_enabled = secrets.admin_secret.is_some(),
            "Auth services initialized"
        );

        Ok(Self {
            config,
            credentials,
            sessions,
            rate_limiter,
            cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryAccountStorage, MemoryKvStore, MemoryTokenStorage};

    #[test]
    fn test_missing_secrets_rejected() {
        let result = AuthServices::new(
            AuthConfig::default(),
            Arc::new(MemoryAccountStorage::new()),
            Arc::new(MemoryTokenStorage::new()),
            Arc::new(MemoryKvStore::new()),
        );
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }
}
