//! Signed cookies carrying the OIDC `state` and `nonce` across the redirect.
//!
//! Values have the form `{token}.{hex hmac-sha256}`.

use anyhow::{Context, Result, anyhow};
use axum::http::HeaderValue;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const STATE_COOKIE: &str = "state";
pub const NONCE_COOKIE: &str = "nonce";

/// Lifetime of the exchange cookies.
pub const EXCHANGE_MAX_AGE_SECONDS: u32 = 3600;

#[derive(Clone)]
pub struct CookieSigner {
    secret: SecretString,
}

impl CookieSigner {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|err| anyhow!("invalid cookie key: {err}"))
    }

    /// # Errors
    /// Returns an error if the HMAC key is rejected.
    pub fn sign(&self, value: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(value.as_bytes());
        Ok(format!(
            "{value}.{}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// The token inside a signed value, or `None` if it was tampered with.
    #[must_use]
    pub fn verify(&self, signed: &str) -> Option<String> {
        let (value, signature) = signed.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(value.as_bytes());
        if mac.verify_slice(&signature).is_ok() {
            Some(value.to_string())
        } else {
            warn!("exchange cookie signature mismatch");
            None
        }
    }

    /// `Set-Cookie` value holding the signed `value`.
    ///
    /// # Errors
    /// Returns an error if signing fails or the value is not a valid header.
    pub fn cookie(&self, name: &str, value: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!(
            "{name}={}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={EXCHANGE_MAX_AGE_SECONDS}",
            self.sign(value)?
        ))
        .context("invalid exchange cookie")
    }
}

/// `Set-Cookie` value deleting an exchange cookie.
///
/// # Errors
/// Returns an error if `name` is not valid in a header.
pub fn expired_cookie(name: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{name}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0"
    ))
    .context("invalid cookie name")
}

/// 32 random bytes, base64url.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn random_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate exchange token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Byte equality that does not stop at the first difference.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
