//! Identity provider boundary: discovery, code exchange and id token checks.
//!
//! Discovery documents and key sets are cached per issuer for a fixed TTL and
//! refreshed on demand. Key sets are also refreshed once when a token names a
//! key id the cached set does not know, which covers key rotation. Such
//! refreshes are spaced at least [`JWKS_REFRESH_COOLDOWN`] apart per key set.

use super::OidcError;
use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{Jwk, JwkSet},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

/// Leeway for `exp`, `nbf` and `iat`.
const CLOCK_SKEW_SECONDS: u64 = 60;

/// Minimum age of a cached key set before an unknown `kid` refetches it.
const JWKS_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

/// Relying-party registration with one provider, read per request.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub name: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// Claims this service reads from a verified id token.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Discovery document of `issuer`.
    async fn metadata(&self, issuer: &str) -> Result<ProviderMetadata, OidcError>;

    /// Redeem an authorization code; returns the raw id token.
    async fn exchange_code(
        &self,
        config: &ProviderConfig,
        metadata: &ProviderMetadata,
        code: &str,
    ) -> Result<String, OidcError>;

    /// Check signature, issuer, audience and expiry of an id token.
    async fn verify_id_token(
        &self,
        config: &ProviderConfig,
        metadata: &ProviderMetadata,
        id_token: &str,
    ) -> Result<IdTokenClaims, OidcError>;
}

#[derive(Clone, Debug)]
struct Cached<T> {
    value: T,
    fetched_at: Instant,
    expires_at: Instant,
}

impl<T> Cached<T> {
    fn new(value: T, ttl: Duration) -> Self {
        let fetched_at = Instant::now();
        Self {
            value,
            fetched_at,
            expires_at: fetched_at + ttl,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

/// Provider reached over HTTPS with `reqwest`.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    ttl: Duration,
    discovery: RwLock<HashMap<String, Cached<ProviderMetadata>>>,
    jwks: RwLock<HashMap<String, Cached<JwkSet>>>,
}

impl HttpIdentityProvider {
    #[must_use]
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            discovery: RwLock::new(HashMap::new()),
            jwks: RwLock::new(HashMap::new()),
        }
    }

    async fn key_set(&self, jwks_uri: &str, refresh: bool) -> Result<JwkSet, OidcError> {
        if let Some(entry) = self.jwks.read().await.get(jwks_uri) {
            let fresh = entry.expires_at > Instant::now();
            let cooling = entry.fetched_at.elapsed() < JWKS_REFRESH_COOLDOWN;
            if fresh && (!refresh || cooling) {
                if refresh {
                    debug!(jwks_uri, "key set refreshed recently, not refetching");
                }
                return Ok(entry.value.clone());
            }
        }

        let jwks: JwkSet = self
            .client
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(jwks_uri, keys = jwks.keys.len(), "key set fetched");
        self.jwks
            .write()
            .await
            .insert(jwks_uri.to_string(), Cached::new(jwks.clone(), self.ttl));
        Ok(jwks)
    }

    async fn decoding_key(
        &self,
        jwks_uri: &str,
        kid: &str,
        alg: Algorithm,
    ) -> Result<DecodingKey, OidcError> {
        let jwks = self.key_set(jwks_uri, false).await?;
        let jwk = match find_jwk(&jwks, kid) {
            Some(jwk) => jwk.clone(),
            None => {
                let refreshed = self.key_set(jwks_uri, true).await?;
                find_jwk(&refreshed, kid)
                    .cloned()
                    .ok_or(OidcError::JwksKeyNotFound)?
            }
        };
        ensure_jwk_matches_algorithm(&jwk, alg)?;
        Ok(DecodingKey::from_jwk(&jwk)?)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn metadata(&self, issuer: &str) -> Result<ProviderMetadata, OidcError> {
        let issuer = issuer.trim_end_matches('/');
        if let Some(entry) = self.discovery.read().await.get(issuer)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.value.clone());
        }

        let url = format!("{issuer}/.well-known/openid-configuration");
        let metadata: ProviderMetadata = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(OidcError::InvalidClaim("discovery issuer".to_string()));
        }
        debug!(issuer, "discovery document fetched");
        self.discovery
            .write()
            .await
            .insert(issuer.to_string(), Cached::new(metadata.clone(), self.ttl));
        Ok(metadata)
    }

    async fn exchange_code(
        &self,
        config: &ProviderConfig,
        metadata: &ProviderMetadata,
        code: &str,
    ) -> Result<String, OidcError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
        ];
        let response: TokenResponse = self
            .client
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .id_token
            .ok_or_else(|| OidcError::InvalidClaim("token response without id_token".to_string()))
    }

    async fn verify_id_token(
        &self,
        config: &ProviderConfig,
        metadata: &ProviderMetadata,
        id_token: &str,
    ) -> Result<IdTokenClaims, OidcError> {
        let header = decode_header(id_token)?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::ES256) {
            return Err(OidcError::UnsupportedAlgorithm);
        }
        let kid = header.kid.as_deref().ok_or(OidcError::MissingKeyId)?;
        let key = self.decoding_key(&metadata.jwks_uri, kid, header.alg).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_audience(&[config.client_id.as_str()]);
        validation
            .required_spec_claims
            .extend(["iss".to_string(), "aud".to_string(), "sub".to_string()]);
        validation.leeway = CLOCK_SKEW_SECONDS;

        Ok(decode::<IdTokenClaims>(id_token, &key, &validation)?.claims)
    }
}

fn find_jwk<'a>(jwks: &'a JwkSet, kid: &str) -> Option<&'a Jwk> {
    jwks.keys
        .iter()
        .find(|key| key.common.key_id.as_deref() == Some(kid))
}

fn ensure_jwk_matches_algorithm(jwk: &Jwk, alg: Algorithm) -> Result<(), OidcError> {
    use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve};
    match (&jwk.algorithm, alg) {
        (AlgorithmParameters::RSA(_), Algorithm::RS256) => Ok(()),
        (AlgorithmParameters::EllipticCurve(params), Algorithm::ES256)
            if params.curve == EllipticCurve::P256 =>
        {
            Ok(())
        }
        _ => Err(OidcError::InvalidJwk("key type does not match algorithm".to_string())),
    }
}
