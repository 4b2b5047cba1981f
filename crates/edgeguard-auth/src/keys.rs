//! Key management for envelope encryption.
//!
//! Every account record gets its own data-encrypting key (DEK). The DEK is
//! never persisted in the clear: it is AES-256-GCM encrypted ("wrapped")
//! under the deployment root key (KEK) and only the wrapped form is stored.
//!
//! ```text
//! root key (KEK, deployment secret)
//!     └── wrapped DEK {ciphertext, iv}   stored with the record
//!             └── encrypted blob        stored with the record
//! ```
//!
//! Raw keys live in [`Zeroizing`] buffers and are wiped when dropped.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::AuthResult;
use crate::error::AuthError;

/// Key size for AES-256 (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-256-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-256-GCM.
pub const TAG_SIZE: usize = 16;

/// Associated data bound to every wrapped key.
const KEY_WRAP_AAD: &[u8] = b"edgeguard-key-wrap-v1";

// =============================================================================
// Key Types
// =============================================================================

/// The root key-encrypting key.
///
/// Supplied out-of-band as deployment configuration and never stored next
/// to the data it protects.
#[derive(Clone)]
pub struct RootKey(Zeroizing<[u8; KEY_SIZE]>);

impl RootKey {
    /// Creates a root key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generates a random root key.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_bytes(random_key_bytes())
    }

    /// Parses a root key from a hex or base64 string.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the string does not decode to
    /// exactly 32 bytes.
    pub fn parse(encoded: &str) -> AuthResult<Self> {
        parse_key(encoded).map(Self::from_bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKey(<redacted>)")
    }
}

/// A raw per-record data-encrypting key.
pub struct DataKey(Zeroizing<[u8; KEY_SIZE]>);

impl DataKey {
    /// Generates a random data key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Zeroizing::new(random_key_bytes()))
    }

    /// Creates a data key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        crate::crypto::constant_time_eq(self.0.as_ref(), other.0.as_ref())
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// A data key encrypted under the root key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// AES-GCM ciphertext of the raw key, tag included.
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,

    /// Nonce used when wrapping.
    #[serde(with = "hex_bytes")]
    pub iv: Vec<u8>,
}

// =============================================================================
// Wrapping
// =============================================================================

/// Generates a fresh data key and wraps it under `root`.
///
/// The raw key is returned alongside its wrapped form so the caller can use
/// it for exactly one encrypt operation before dropping it.
///
/// # Errors
///
/// Returns `AuthError::Internal` if the cipher cannot be initialized.
pub fn wrap_key(root: &RootKey) -> AuthResult<(DataKey, WrappedKey)> {
    let key = DataKey::generate();
    let wrapped = wrap_existing_key(root, &key)?;
    Ok((key, wrapped))
}

/// Wraps an existing data key under `root` with a fresh IV.
///
/// # Errors
///
/// Returns `AuthError::Internal` if the cipher cannot be initialized.
pub fn wrap_existing_key(root: &RootKey, key: &DataKey) -> AuthResult<WrappedKey> {
    let iv = generate_iv();
    let ciphertext = encrypt_raw(root.as_bytes(), &iv, key.as_bytes(), KEY_WRAP_AAD)?;
    Ok(WrappedKey {
        ciphertext,
        iv: iv.to_vec(),
    })
}

/// Recovers the raw data key from its wrapped form.
///
/// # Errors
///
/// Returns `AuthError::KeyUnwrap` if the tag does not verify (the wrapped key
/// was tampered with or `root` is not the key it was wrapped under).
pub fn unwrap_key(root: &RootKey, wrapped: &WrappedKey) -> AuthResult<DataKey> {
    let plaintext = decrypt_raw(root.as_bytes(), &wrapped.iv, &wrapped.ciphertext, KEY_WRAP_AAD)
        .map_err(|_| AuthError::KeyUnwrap)?;

    let bytes: [u8; KEY_SIZE] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| AuthError::KeyUnwrap)?;
    Ok(DataKey::from_bytes(bytes))
}

/// Re-wraps a data key under a new root key.
///
/// The data encrypted under the DEK is untouched, so rotating the root key
/// only rewrites the small wrapped-key column.
///
/// # Errors
///
/// Returns `AuthError::KeyUnwrap` if `wrapped` does not open under `old_root`.
pub fn rewrap_key(old_root: &RootKey, new_root: &RootKey, wrapped: &WrappedKey) -> AuthResult<WrappedKey> {
    let key = unwrap_key(old_root, wrapped)?;
    wrap_existing_key(new_root, &key)
}

// =============================================================================
// Sealing
// =============================================================================

/// Encrypts `plaintext` under `key` and returns `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns `AuthError::Internal` if the cipher cannot be initialized.
pub fn seal(key: &RootKey, plaintext: &[u8], aad: &[u8]) -> AuthResult<Vec<u8>> {
    let iv = generate_iv();
    let ciphertext = encrypt_raw(key.as_bytes(), &iv, plaintext, aad)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a value produced by [`seal`].
///
/// # Errors
///
/// Returns `AuthError::Decryption` if the input is truncated or fails
/// authentication.
pub fn open(key: &RootKey, sealed: &[u8], aad: &[u8]) -> AuthResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(AuthError::Decryption);
    }
    let (iv, ciphertext) = sealed.split_at(NONCE_SIZE);
    decrypt_raw(key.as_bytes(), iv, ciphertext, aad)
}

// =============================================================================
// Primitives
// =============================================================================

/// Generates a random 96-bit nonce.
#[must_use]
pub fn generate_iv() -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

fn random_key_bytes() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn encrypt_raw(
    key: &[u8; KEY_SIZE],
    iv: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> AuthResult<Vec<u8>> {
    if iv.len() != NONCE_SIZE {
        return Err(AuthError::internal(format!(
            "IV must be {NONCE_SIZE} bytes, got {}",
            iv.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AuthError::internal(format!("Failed to create cipher: {e}")))?;

    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| AuthError::internal("Encryption failed"))
}

pub(crate) fn decrypt_raw(
    key: &[u8; KEY_SIZE],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> AuthResult<Zeroizing<Vec<u8>>> {
    if iv.len() != NONCE_SIZE {
        return Err(AuthError::Decryption);
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AuthError::internal(format!("Failed to create cipher: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| AuthError::Decryption)
}

/// Parses a 32-byte key from a hex or base64 string.
pub(crate) fn parse_key(encoded: &str) -> AuthResult<[u8; KEY_SIZE]> {
    let encoded = encoded.trim();

    // Try hex first
    if encoded.len() == KEY_SIZE * 2
        && let Ok(bytes) = hex::decode(encoded)
    {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let bytes = Zeroizing::new(
        BASE64
            .decode(encoded)
            .map_err(|e| AuthError::configuration(format!("Invalid key encoding: {e}")))?,
    );

    if bytes.len() != KEY_SIZE {
        return Err(AuthError::configuration(format!(
            "Key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Serde helpers that store byte vectors as lowercase hex.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let root = RootKey::generate();
        let (key, wrapped) = wrap_key(&root).unwrap();

        let unwrapped = unwrap_key(&root, &wrapped).unwrap();
        assert_eq!(unwrapped, key);
        assert_eq!(wrapped.iv.len(), NONCE_SIZE);
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_unwrap_with_wrong_root_fails() {
        let root = RootKey::generate();
        let other = RootKey::generate();
        let (_, wrapped) = wrap_key(&root).unwrap();

        let err = unwrap_key(&other, &wrapped).unwrap_err();
        assert!(matches!(err, AuthError::KeyUnwrap));
    }

    #[test]
    fn test_every_bit_flip_in_wrapped_key_is_detected() {
        let root = RootKey::generate();
        let (_, wrapped) = wrap_key(&root).unwrap();

        for byte in 0..wrapped.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = wrapped.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(
                    matches!(unwrap_key(&root, &tampered), Err(AuthError::KeyUnwrap)),
                    "flip at byte {byte} bit {bit} was not detected"
                );
            }
        }

        for byte in 0..wrapped.iv.len() {
            let mut tampered = wrapped.clone();
            tampered.iv[byte] ^= 0x01;
            assert!(matches!(
                unwrap_key(&root, &tampered),
                Err(AuthError::KeyUnwrap)
            ));
        }
    }

    #[test]
    fn test_wrapping_same_key_twice_uses_fresh_iv() {
        let root = RootKey::generate();
        let key = DataKey::generate();
        let a = wrap_existing_key(&root, &key).unwrap();
        let b = wrap_existing_key(&root, &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_rewrap_under_new_root() {
        let old_root = RootKey::generate();
        let new_root = RootKey::generate();
        let (key, wrapped) = wrap_key(&old_root).unwrap();

        let rewrapped = rewrap_key(&old_root, &new_root, &wrapped).unwrap();
        assert_eq!(unwrap_key(&new_root, &rewrapped).unwrap(), key);
        assert!(unwrap_key(&old_root, &rewrapped).is_err());
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = RootKey::generate();
        let sealed = seal(&key, b"secret token", b"ctx").unwrap();
        let opened = open(&key, &sealed, b"ctx").unwrap();
        assert_eq!(opened.as_slice(), b"secret token");

        // Wrong associated data must fail
        assert!(matches!(
            open(&key, &sealed, b"other"),
            Err(AuthError::Decryption)
        ));
        // Truncated input must fail
        assert!(matches!(
            open(&key, &sealed[..10], b"ctx"),
            Err(AuthError::Decryption)
        ));
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let bytes = [7u8; KEY_SIZE];
        let from_hex = parse_key(&hex::encode(bytes)).unwrap();
        assert_eq!(from_hex, bytes);

        let from_b64 = parse_key(&BASE64.encode(bytes)).unwrap();
        assert_eq!(from_b64, bytes);

        let err = parse_key(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let root = RootKey::from_bytes([0xAB; KEY_SIZE]);
        let debug = format!("{root:?}");
        assert!(!debug.contains("ab"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_wrapped_key_serde_uses_hex() {
        let wrapped = WrappedKey {
            ciphertext: vec![0xde, 0xad],
            iv: vec![0xbe, 0xef],
        };
        let json = serde_json::to_value(&wrapped).unwrap();
        assert_eq!(json["ciphertext"], "dead");
        assert_eq!(json["iv"], "beef");
        let back: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, wrapped);
    }
}
