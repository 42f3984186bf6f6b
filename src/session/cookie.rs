//! Session token generation and the `session_token` cookie.

use anyhow::{Context, Result};
use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

pub const SESSION_COOKIE_NAME: &str = "session_token";

/// Create a new session token for the auth cookie.
/// The raw value is only returned to set the cookie; the store keeps a hash.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a session token so raw values never reach the store.
#[must_use]
pub fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// `Set-Cookie` value for a live session expiring at `expires_at`.
///
/// # Errors
/// Returns an error if the token contains bytes not allowed in a header.
pub fn session_cookie(
    token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = (expires_at - now).num_seconds().max(0);
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={max_age}; Expires={}",
        http_date(expires_at)
    ))
}

/// `Set-Cookie` value that deletes the session cookie.
#[must_use]
pub fn expired_session_cookie() -> HeaderValue {
    HeaderValue::from_static(
        "session_token=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
    )
}

/// Value of the session cookie, if the request carries one.
#[must_use]
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, SESSION_COOKIE_NAME)
}

/// Value of the first non-empty cookie called `name` across all `Cookie` headers.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[must_use]
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
