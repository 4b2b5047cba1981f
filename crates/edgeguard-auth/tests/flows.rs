//! End-to-end flows over the in-memory backends.
//!
//! Covers registration, login, bearer verification, expiry, revocation,
//! rate limiting and cache-aside reads wired through `AuthServices`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use edgeguard_auth::config::{PasswordConfig, SecretsConfig};
use edgeguard_auth::rate_limit::client_identifier;
use edgeguard_auth::storage::{MemoryAccountStorage, MemoryKvStore, MemoryTokenStorage};
use edgeguard_auth::{
    AccountBuilder, AccountPatch, AuthConfig, AuthError, AuthServices, CacheKey, ManualClock,
    RateLimitedOperation,
};
use time::macros::datetime;

const ADMIN_SECRET: &str = "static-admin-secret-for-tests";

struct Harness {
    services: AuthServices,
    accounts: Arc<MemoryAccountStorage>,
    kv: Arc<MemoryKvStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 12:00 UTC)));
    let accounts = Arc::new(MemoryAccountStorage::new());
    let tokens = Arc::new(MemoryTokenStorage::new());
    let kv = Arc::new(MemoryKvStore::with_clock(clock.clone()));

    let config = AuthConfig {
        secrets: SecretsConfig {
            root_key: Some(hex::encode([7u8; 32])),
            lookup_key: Some(base64::engine::general_purpose::STANDARD.encode([9u8; 32])),
            admin_secret: Some(ADMIN_SECRET.to_string()),
        },
        password: PasswordConfig {
            memory_kib: 1024,
            iterations: 1,
            ..PasswordConfig::default()
        },
        ..AuthConfig::default()
    };

    let services = AuthServices::with_clock(
        config,
        accounts.clone(),
        tokens,
        kv.clone(),
        clock.clone(),
    )
    .expect("valid test configuration");

    Harness {
        services,
        accounts,
        kv,
        clock,
    }
}

fn basic(username: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

#[tokio::test]
async fn register_alice_and_reject_short_password() {
    let h = harness();

    let alice = h
        .services
        .credentials
        .create_account(
            AccountBuilder::new()
                .username("alice")
                .password("correcthorse1")
                .profile(br#"{"displayName":"Alice"}"#.to_vec()),
        )
        .await
        .unwrap();
    assert_eq!(alice.username, "alice");

    let err = h
        .services
        .credentials
        .create_account(AccountBuilder::new().username("carol").password("short"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.accounts.len(), 1);
}

#[tokio::test]
async fn login_then_bearer_resolves_account() {
    let h = harness();
    let alice = h
        .services
        .credentials
        .create_account(AccountBuilder::new().username("alice").password("correcthorse1"))
        .await
        .unwrap();

    let (_, issued) = h
        .services
        .sessions
        .login(&basic("alice", "correcthorse1"))
        .await
        .unwrap();

    let principal = h
        .services
        .sessions
        .authenticate(&format!("Bearer {}", issued.token))
        .await
        .unwrap();
    assert_eq!(principal.account().map(|a| a.id.as_str()), Some(alice.id.as_str()));

    // Basic on every request also works
    let principal = h
        .services
        .sessions
        .authenticate(&basic("alice", "correcthorse1"))
        .await
        .unwrap();
    assert!(!principal.is_admin());
}

#[tokio::test]
async fn session_for_u1_and_one_character_off() {
    let h = harness();
    let issued = h.services.sessions.issue_session("u1").await.unwrap();

    let record = h.services.sessions.verify_token(&issued.token).await.unwrap();
    assert_eq!(record.owner_id, "u1");

    let mut forged: Vec<char> = issued.token.chars().collect();
    let mid = forged.len() / 2;
    forged[mid] = if forged[mid] == 'a' { 'b' } else { 'a' };
    let forged: String = forged.into_iter().collect();

    let err = h.services.sessions.verify_token(&forged).await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized { .. }));
}

#[tokio::test]
async fn session_expires_after_thirty_days() {
    let h = harness();
    let issued = h.services.sessions.issue_session("u1").await.unwrap();
    assert_eq!(issued.expires_at, datetime!(2024-07-01 12:00 UTC));

    h.clock.advance(time::Duration::days(30) + time::Duration::seconds(1));
    let err = h.services.sessions.verify_token(&issued.token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));
}

#[tokio::test]
async fn revoked_session_is_rejected() {
    let h = harness();
    let issued = h.services.sessions.issue_session("u1").await.unwrap();

    assert!(h.services.sessions.revoke(&issued.token).await.unwrap());
    let err = h.services.sessions.verify_token(&issued.token).await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized { .. }));
}

#[tokio::test]
async fn admin_secret_has_no_backing_row() {
    let h = harness();
    let principal = h
        .services
        .sessions
        .authenticate(&format!("Bearer {ADMIN_SECRET}"))
        .await
        .unwrap();
    assert!(principal.is_admin());
    assert!(h.accounts.is_empty());
}

#[tokio::test]
async fn login_rate_limit_four_calls() {
    let h = harness();
    let limiter = &h.services.rate_limiter;
    let window = Duration::from_secs(60);

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let decision = limiter
            .check_and_increment("login", "198.51.100.4", 3, window)
            .await;
        outcomes.push(decision.allowed);
        assert!(decision.remaining <= 3);
    }
    assert_eq!(outcomes, vec![true, true, true, false]);

    h.clock.advance(time::Duration::seconds(60));
    assert!(
        limiter
            .check_and_increment("login", "198.51.100.4", 3, window)
            .await
            .allowed
    );
}

#[tokio::test]
async fn account_creation_sixth_request_is_429() {
    let h = harness();
    let identifier = client_identifier(Some("203.0.113.9"), None);

    for _ in 0..5 {
        h.services
            .rate_limiter
            .enforce(RateLimitedOperation::AccountCreation, &identifier)
            .await
            .unwrap();
    }

    let err = h
        .services
        .rate_limiter
        .enforce(RateLimitedOperation::AccountCreation, &identifier)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    match err {
        AuthError::RateLimited { retry_after } => {
            assert!(retry_after <= Duration::from_secs(300));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limiter_fails_open_but_cache_does_not() {
    let h = harness();
    h.kv.set_available(false);

    for _ in 0..10 {
        let decision = h
            .services
            .rate_limiter
            .check(RateLimitedOperation::Login, "198.51.100.4")
            .await;
        assert!(decision.allowed);
    }

    let result: Result<u32, AuthError> = h
        .services
        .cache
        .try_cache("entity:1", || async { Ok(1) })
        .await;
    assert!(matches!(result, Err(AuthError::StoreUnavailable { .. })));
}

#[tokio::test]
async fn try_cache_holds_value_until_cleared_or_stale() {
    let h = harness();
    let cache = &h.services.cache;
    let version = AtomicU32::new(1);
    let current = &version;
    let load = move || async move { Ok::<_, AuthError>(current.load(Ordering::SeqCst)) };

    assert_eq!(cache.try_cache("entity:42", load).await.unwrap(), 1);
    version.store(2, Ordering::SeqCst);
    assert_eq!(cache.try_cache("entity:42", load).await.unwrap(), 1);

    cache.clear_cache("entity:42").await.unwrap();
    assert_eq!(cache.try_cache("entity:42", load).await.unwrap(), 2);

    version.store(3, Ordering::SeqCst);
    h.clock.advance(time::Duration::seconds(301));
    assert_eq!(cache.try_cache("entity:42", load).await.unwrap(), 3);
}

#[tokio::test]
async fn profile_update_is_visible_through_cache() {
    let h = harness();
    let alice = h
        .services
        .credentials
        .create_account(
            AccountBuilder::new()
                .username("alice")
                .password("correcthorse1")
                .profile(b"v1".to_vec()),
        )
        .await
        .unwrap();

    let issued = h.services.sessions.issue_session(&alice.id).await.unwrap();
    let before = h.services.sessions.verify_bearer(&issued.token).await.unwrap();
    assert_eq!(before.account().unwrap().profile, b"v1".to_vec());

    h.services
        .credentials
        .update_account(&alice.id, AccountPatch::new().profile(b"v2".to_vec()))
        .await
        .unwrap();

    let after = h.services.sessions.verify_bearer(&issued.token).await.unwrap();
    assert_eq!(after.account().unwrap().profile, b"v2".to_vec());
}

#[tokio::test]
async fn account_deletion_revokes_tokens_and_lists() {
    let h = harness();
    let alice = h
        .services
        .credentials
        .create_account(AccountBuilder::new().username("alice").password("correcthorse1"))
        .await
        .unwrap();
    let issued = h.services.sessions.issue_api_token(&alice.id).await.unwrap();

    let list_key = CacheKey::account_list(&[("page", "1")]);
    let _: Vec<String> = h
        .services
        .cache
        .try_cache(&list_key, || async { Ok(vec![alice.id.clone()]) })
        .await
        .unwrap();

    assert!(h.services.credentials.delete_account(&alice.id).await.unwrap());

    assert!(h.services.sessions.verify_bearer(&issued.token).await.is_err());
    assert!(h.services.sessions.list_tokens(&alice.id).await.unwrap().is_empty());

    let reloaded: Vec<String> = h
        .services
        .cache
        .try_cache(&list_key, || async { Ok(Vec::new()) })
        .await
        .unwrap();
    assert!(reloaded.is_empty());
}
