//! Authorization header parsing.
//!
//! Supports `Basic base64(username:password)` and `Bearer <token>`. Scheme
//! names are matched case-insensitively. Error messages never echo the
//! credential.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use zeroize::Zeroizing;

use crate::AuthResult;
use crate::error::AuthError;

/// Credentials carried by an `Authorization` header.
pub enum Credentials {
    /// Username and password.
    Basic {
        /// Login name.
        username: String,
        /// Plaintext password.
        password: Zeroizing<String>,
    },
    /// Raw bearer token or admin secret.
    Bearer(Zeroizing<String>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Parses an `Authorization` header value.
///
/// # Errors
///
/// Returns `AuthError::Unauthorized` if the scheme is unknown or the
/// credentials are malformed.
pub fn parse_authorization(header: &str) -> AuthResult<Credentials> {
    let (scheme, rest) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| AuthError::unauthorized("Malformed Authorization header"))?;

    if scheme.eq_ignore_ascii_case("basic") {
        let (username, password) = decode_basic(rest.trim())?;
        Ok(Credentials::Basic { username, password })
    } else if scheme.eq_ignore_ascii_case("bearer") {
        let token = rest.trim();
        if token.is_empty() {
            return Err(AuthError::unauthorized("Empty bearer token"));
        }
        Ok(Credentials::Bearer(Zeroizing::new(token.to_string())))
    } else {
        Err(AuthError::unauthorized("Unsupported authorization scheme"))
    }
}

/// Parses a `Basic` header value into username and password.
///
/// # Errors
///
/// Returns `AuthError::Unauthorized` if the header is not Basic or the
/// credentials are malformed.
pub fn parse_basic(header: &str) -> AuthResult<(String, Zeroizing<String>)> {
    match parse_authorization(header)? {
        Credentials::Basic { username, password } => Ok((username, password)),
        Credentials::Bearer(_) => Err(AuthError::unauthorized(
            "Authorization header must use the Basic scheme",
        )),
    }
}

fn decode_basic(encoded: &str) -> AuthResult<(String, Zeroizing<String>)> {
    let decoded = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::unauthorized("Invalid base64 encoding in credentials"))?,
    );

    let text = std::str::from_utf8(&decoded)
        .map_err(|_| AuthError::unauthorized("Invalid UTF-8 in decoded credentials"))?;

    // Only the first colon separates; passwords may contain more
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| AuthError::unauthorized("Credentials must be in format 'username:password'"))?;

    if username.is_empty() {
        return Err(AuthError::unauthorized("Empty username"));
    }

    Ok((username.to_string(), Zeroizing::new(password.to_string())))
}
