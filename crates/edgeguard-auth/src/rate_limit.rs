//! Fixed-window request counters on the key-value store.
//!
//! Each window is identified by its truncated start time, so a counter key
//! looks like `login:203.0.113.7:1704067200000`. Counters reset implicitly
//! when the window start changes and expire from the store once their
//! window has passed.
//!
//! # Consistency
//!
//! A check reads the counter, compares it against the limit and only then
//! increments. The increment itself is atomic, but the read-compare-increment
//! sequence is not, so concurrent requests in one window can admit slightly
//! more than the limit. This approximation is accepted.
//!
//! # Availability
//!
//! If the store cannot be reached the check is allowed (fail-open) and a
//! warning is logged. This is the only component that fails open.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::AuthResult;
use crate::clock::{Clock, from_unix_millis, unix_millis};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::{KvError, KvStore};

/// Identifier used when no client address is known.
pub const ANONYMOUS_IDENTIFIER: &str = "anonymous";

/// A request budget per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests admitted per window.
    pub requests: u32,

    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitRule {
    /// Creates a rule.
    #[must_use]
    pub const fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

/// Operations with a static rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitedOperation {
    /// Password logins.
    Login,
    /// Account registration.
    AccountCreation,
    /// Explicit API token issuance.
    TokenIssuance,
    /// Password changes.
    PasswordChange,
    /// Any other authenticated call.
    Api,
}

impl RateLimitedOperation {
    /// Every operation, in table order.
    pub const ALL: [Self; 5] = [
        Self::Login,
        Self::AccountCreation,
        Self::TokenIssuance,
        Self::PasswordChange,
        Self::Api,
    ];

    /// Name used in counter keys and configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::AccountCreation => "account_creation",
            Self::TokenIssuance => "token_issuance",
            Self::PasswordChange => "password_change",
            Self::Api => "api",
        }
    }

    /// Parses an operation name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Built-in limit for this operation.
    #[must_use]
    pub fn default_rule(self) -> RateLimitRule {
        match self {
            Self::Login => RateLimitRule::new(3, Duration::from_secs(60)),
            Self::AccountCreation => RateLimitRule::new(5, Duration::from_secs(5 * 60)),
            Self::TokenIssuance => RateLimitRule::new(10, Duration::from_secs(60)),
            Self::PasswordChange => RateLimitRule::new(5, Duration::from_secs(15 * 60)),
            Self::Api => RateLimitRule::new(600, Duration::from_secs(60)),
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Requests admitted per window.
    pub limit: u32,
    /// Requests left in this window; never negative.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at: OffsetDateTime,
    /// Time until `reset_at`; zero if already passed.
    pub retry_after: Duration,
}

/// Fixed-window rate limiter.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: Arc<AuthConfig>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter over `kv`.
    pub fn new(kv: Arc<dyn KvStore>, config: Arc<AuthConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, config, clock }
    }

    /// Checks and counts one request for `operation` from `identifier`.
    pub async fn check(&self, operation: RateLimitedOperation, identifier: &str) -> RateLimitDecision {
        let rule = self.config.rate_limiting.rule_for(operation);
        if !self.config.rate_limiting.enabled {
            return self.unlimited(rule);
        }
        self.check_and_increment(operation.as_str(), identifier, rule.requests, rule.window)
            .await
    }

    /// Like [`check`](Self::check), but turns a denial into an error.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RateLimited` carrying the time until the window
    /// resets.
    pub async fn enforce(
        &self,
        operation: RateLimitedOperation,
        identifier: &str,
    ) -> AuthResult<RateLimitDecision> {
        let decision = self.check(operation, identifier).await;
        if decision.allowed {
            Ok(decision)
        } else {
            tracing::debug!(
                operation = operation.as_str(),
                identifier,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            Err(AuthError::RateLimited {
                retry_after: decision.retry_after,
            })
        }
    }

    /// Counts one request against `{scope}:{identifier}:{window_start}`.
    ///
    /// Fails open: any store error admits the request.
    #[instrument(skip(self))]
    pub async fn check_and_increment(
        &self,
        scope: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let now_ms = unix_millis(now);
        let window_ms = (window.as_millis() as i64).max(1);
        let window_start = now_ms.div_euclid(window_ms) * window_ms;
        let reset_ms = window_start + window_ms;
        let reset_at = from_unix_millis(reset_ms);
        let retry_after = Duration::from_millis((reset_ms - now_ms).max(0) as u64);

        let decision = |allowed: bool, remaining: u32| RateLimitDecision {
            allowed,
            limit,
            remaining,
            reset_at,
            retry_after,
        };

        let key = format!("{scope}:{identifier}:{window_start}");
        match self.count(&key, retry_after, limit).await {
            Ok(Some(count)) => decision(true, limit.saturating_sub(count)),
            Ok(None) => decision(false, 0),
            Err(e) => {
                tracing::warn!(error = %e, "Rate limit store unavailable, allowing request");
                decision(true, limit)
            }
        }
    }

    /// Returns the new count if admitted, `None` if the limit is reached.
    async fn count(&self, key: &str, ttl: Duration, limit: u32) -> Result<Option<u32>, KvError> {
        let current = match self.kv.get(key).await? {
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                tracing::warn!(key, "Non-integer rate limit counter treated as zero");
                0
            }),
            None => 0,
        };

        if current >= i64::from(limit) {
            return Ok(None);
        }

        let ttl = ttl.max(Duration::from_millis(1));
        let count = self.kv.increment(key, ttl).await?;
        Ok(Some(u32::try_from(count.max(0)).unwrap_or(u32::MAX)))
    }

    fn unlimited(&self, rule: RateLimitRule) -> RateLimitDecision {
        let now = self.clock.now();
        RateLimitDecision {
            allowed: true,
            limit: rule.requests,
            remaining: rule.requests,
            reset_at: now + rule.window,
            retry_after: Duration::ZERO,
        }
    }
}

/// Picks the identifier a request is counted under.
///
/// Precedence: first entry of the forwarded-for header, then the direct peer
/// address, then [`ANONYMOUS_IDENTIFIER`].
#[must_use]
pub fn client_identifier(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> String {
    if let Some(client) = forwarded_for
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        return client.to_string();
    }

    peer.map_or_else(|| ANONYMOUS_IDENTIFIER.to_string(), |ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKvStore;
    use time::macros::datetime;

    fn setup() -> (RateLimiter, Arc<MemoryKvStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00:10 UTC)));
        let kv = Arc::new(MemoryKvStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(kv.clone(), Arc::new(AuthConfig::default()), clock.clone());
        (limiter, kv, clock)
    }

    #[tokio::test]
    async fn test_four_calls_limit_three() {
        let (limiter, _, clock) = setup();
        let window = Duration::from_secs(60);

        let mut allowed = Vec::new();
        let mut remaining = Vec::new();
        for _ in 0..4 {
            let d = limiter.check_and_increment("login", "1.2.3.4", 3, window).await;
            allowed.push(d.allowed);
            remaining.push(d.remaining);
        }
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);

        // Next window starts at 00:01:00
        clock.advance(time::Duration::seconds(50));
        let d = limiter.check_and_increment("login", "1.2.3.4", 3, window).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn test_window_alignment_and_reset() {
        let (limiter, kv, _) = setup();
        let d = limiter
            .check_and_increment("login", "1.2.3.4", 3, Duration::from_secs(60))
            .await;

        assert_eq!(d.reset_at, datetime!(2024-01-01 00:01 UTC));
        assert_eq!(d.retry_after, Duration::from_secs(50));

        let window_start = unix_millis(datetime!(2024-01-01 00:00 UTC));
        let key = format!("login:1.2.3.4:{window_start}");
        assert_eq!(kv.get(&key).await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.ttl(&key), Some(Duration::from_secs(50)));
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (limiter, _, _) = setup();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            limiter.check_and_increment("login", "a", 3, window).await;
        }
        assert!(!limiter.check_and_increment("login", "a", 3, window).await.allowed);
        assert!(limiter.check_and_increment("login", "b", 3, window).await.allowed);
        assert!(limiter.check_and_increment("signup", "a", 3, window).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_down() {
        let (limiter, kv, _) = setup();
        kv.set_available(false);
        for _ in 0..10 {
            let d = limiter
                .check_and_increment("login", "1.2.3.4", 3, Duration::from_secs(60))
                .await;
            assert!(d.allowed);
        }
    }

    #[tokio::test]
    async fn test_enforce_account_creation() {
        let (limiter, _, _) = setup();
        for _ in 0..5 {
            limiter
                .enforce(RateLimitedOperation::AccountCreation, "1.2.3.4")
                .await
                .unwrap();
        }
        let err = limiter
            .enforce(RateLimitedOperation::AccountCreation, "1.2.3.4")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_disabled_limiter_never_counts() {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(MemoryKvStore::with_clock(clock.clone()));
        let mut config = AuthConfig::default();
        config.rate_limiting.enabled = false;
        let limiter = RateLimiter::new(kv.clone(), Arc::new(config), clock);

        for _ in 0..10 {
            assert!(limiter.check(RateLimitedOperation::Login, "x").await.allowed);
        }
        assert!(kv.is_empty());
    }

    #[test]
    fn test_default_rule_table() {
        assert_eq!(
            RateLimitedOperation::Login.default_rule(),
            RateLimitRule::new(3, Duration::from_secs(60))
        );
        assert_eq!(
            RateLimitedOperation::AccountCreation.default_rule(),
            RateLimitRule::new(5, Duration::from_secs(300))
        );
        for op in RateLimitedOperation::ALL {
            assert_eq!(RateLimitedOperation::from_name(op.as_str()), Some(op));
        }
    }

    #[test]
    fn test_client_identifier_precedence() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            client_identifier(Some("203.0.113.7, 10.0.0.2"), Some(peer)),
            "203.0.113.7"
        );
        assert_eq!(client_identifier(Some("  "), Some(peer)), "10.0.0.1");
        assert_eq!(client_identifier(None, Some(peer)), "10.0.0.1");
        assert_eq!(client_identifier(None, None), ANONYMOUS_IDENTIFIER);
    }
}
