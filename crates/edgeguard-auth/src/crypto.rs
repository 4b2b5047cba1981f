//! Hashing and comparison primitives shared by credentials and sessions.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::AuthResult;
use crate::error::AuthError;

/// Size of random salts in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of random token secrets in bytes.
pub const TOKEN_SECRET_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Compares two byte slices in constant time.
///
/// Slices of different length compare unequal; only the length is leaked.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Compares two strings in constant time.
#[must_use]
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

/// Generates a random salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Generates a random token of the form `{prefix}{64 hex chars}`.
#[must_use]
pub fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_SECRET_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

/// Deterministic keyed hash used to index a secret without storing it.
///
/// Returns lowercase hex of `HMAC-SHA256(key, value)`.
///
/// # Errors
///
/// Returns `AuthError::Internal` if the MAC cannot be keyed.
pub fn lookup_hash(key: &[u8], value: &str) -> AuthResult<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::internal(format!("Failed to key lookup hash: {e}")))?;
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Salted verifier for a token: lowercase hex of `SHA-256(salt || value)`.
#[must_use]
pub fn token_verifier(salt: &[u8], value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_str_eq("admin-secret", "admin-secret"));
        assert!(!constant_time_str_eq("admin-secret", "admin-secreT"));
    }

    #[test]
    fn test_lookup_hash_is_deterministic_and_keyed() {
        let a = lookup_hash(b"key-one", "token").unwrap();
        let b = lookup_hash(b"key-one", "token").unwrap();
        let c = lookup_hash(b"key-two", "token").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_token_verifier_depends_on_salt() {
        let a = token_verifier(b"salt-a", "token");
        let b = token_verifier(b"salt-b", "token");
        assert_ne!(a, b);
        assert_eq!(a, token_verifier(b"salt-a", "token"));
    }

    #[test]
    fn test_generate_token_format() {
        let token = generate_token("egs_");
        assert!(token.starts_with("egs_"));
        assert_eq!(token.len(), 4 + TOKEN_SECRET_SIZE * 2);
        assert_ne!(token, generate_token("egs_"));
    }
}
