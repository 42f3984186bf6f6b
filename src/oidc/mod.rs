//! OpenID Connect federation.
//!
//! Flow overview:
//! 1) `call`: mint `state` and `nonce`, store each in a signed cookie and send
//!    the browser to the provider's authorization endpoint.
//! 2) `callback`: the `state` query parameter must equal the `state` cookie.
//!    The code is exchanged, the id token verified and its `nonce` compared
//!    with the `nonce` cookie.
//! 3) The verified email selects the local user, creating one on first login.
//!    A session starts and the exchange cookies are cleared.
//!
//! Failures never tell the browser which check failed.

use crate::{
    error::{DenialReason, GateError},
    session::{SessionManager, cookie::cookie_value},
    store::{self, Params, StoreConnection, StoreError},
    tenant::TenantId,
};
use axum::http::{HeaderMap, HeaderValue};
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use utoipa::IntoParams;
use uuid::Uuid;

pub mod cookies;
pub mod provider;

pub use cookies::{CookieSigner, NONCE_COOKIE, STATE_COOKIE};
pub use provider::{
    HttpIdentityProvider, IdTokenClaims, IdentityProvider, ProviderConfig, ProviderMetadata,
};

const OIDC_PROVIDER: &str = "portier.oidc_provider";
const USER_BY_EMAIL: &str = "portier.user_by_email";
const PROVISION_FEDERATED_USER: &str = "portier.provision_federated_user";

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("identity provider {0} is not configured for this tenant")]
    NotConfigured(String),
    #[error("state does not match")]
    StateMismatch,
    #[error("nonce does not match")]
    NonceMismatch,
    #[error("provider returned an error: {0}")]
    ProviderError(String),
    #[error("callback without an authorization code")]
    MissingCode,
    #[error("id token carries no verified email")]
    MissingEmail,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("missing key id")]
    MissingKeyId,
    #[error("jwks key not found")]
    JwksKeyNotFound,
    #[error("invalid jwk: {0}")]
    InvalidJwk(String),
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<OidcError> for GateError {
    fn from(err: OidcError) -> Self {
        match err {
            OidcError::NotConfigured(_) => Self::BadRequest("Unknown identity provider".to_string()),
            OidcError::Http(err) => Self::Internal(anyhow::Error::new(err)),
            OidcError::Invariant(detail) => Self::Invariant(detail),
            OidcError::Store(err) => Self::Store(err),
            OidcError::Gate(err) => err,
            OidcError::Internal(err) => Self::Internal(err),
            rejected => {
                debug!(reason = %rejected, "federated login rejected");
                Self::Denied(DenialReason::FederationRejected)
            }
        }
    }
}

/// Query string of the provider's redirect back to us.
#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Where to send the browser, and the exchange cookies to set.
#[derive(Clone, Debug)]
pub struct Authorization {
    pub redirect: String,
    pub cookies: Vec<HeaderValue>,
}

/// A completed federated login.
#[derive(Clone, Debug)]
pub struct FederatedLogin {
    pub user_id: Uuid,
    pub landing_path: Option<String>,
    /// Session cookie first, then the cleared exchange cookies.
    pub cookies: Vec<HeaderValue>,
}

#[derive(Debug, Deserialize)]
struct ProviderRow {
    issuer: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    #[serde(default)]
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FederatedUser {
    user_id: Uuid,
    #[serde(default)]
    landing_path: Option<String>,
}

pub struct OidcDriver {
    provider: Arc<dyn IdentityProvider>,
    signer: CookieSigner,
}

impl OidcDriver {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, signer: CookieSigner) -> Self {
        Self { provider, signer }
    }

    /// Provider registration of `tenant` named `provider`.
    ///
    /// # Errors
    /// [`OidcError::NotConfigured`] when absent, [`OidcError::Invariant`] when
    /// the name is ambiguous.
    pub async fn provider_config(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        provider: &str,
    ) -> Result<ProviderConfig, OidcError> {
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_provider", provider);
        let mut rows: Vec<ProviderRow> = store::query(conn, OIDC_PROVIDER, &params).await?;
        if rows.len() > 1 {
            return Err(OidcError::Invariant(format!(
                "provider {provider} is configured {} times",
                rows.len()
            )));
        }
        let row = rows
            .pop()
            .ok_or_else(|| OidcError::NotConfigured(provider.to_string()))?;
        let scopes = row
            .scopes
            .filter(|scopes| !scopes.is_empty())
            .unwrap_or_else(|| vec!["openid".to_string(), "email".to_string()]);
        Ok(ProviderConfig {
            name: provider.to_string(),
            issuer: row.issuer,
            client_id: row.client_id,
            client_secret: SecretString::from(row.client_secret),
            redirect_uri: row.redirect_uri,
            scopes,
        })
    }

    /// Build the authorization redirect for `provider`.
    ///
    /// # Errors
    /// Fails when the provider is unknown, discovery fails or the
    /// authorization endpoint is not a valid URL.
    pub async fn call(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        provider: &str,
    ) -> Result<Authorization, OidcError> {
        let config = self.provider_config(conn, tenant, provider).await?;
        let metadata = self.provider.metadata(&config.issuer).await?;

        let state = cookies::random_token()?;
        let nonce = cookies::random_token()?;
        let mut scopes = config.scopes.clone();
        if !scopes.iter().any(|scope| scope == "openid") {
            scopes.insert(0, "openid".to_string());
        }

        let redirect = Url::parse_with_params(
            &metadata.authorization_endpoint,
            [
                ("response_type", "code"),
                ("client_id", config.client_id.as_str()),
                ("redirect_uri", config.redirect_uri.as_str()),
                ("scope", scopes.join(" ").as_str()),
                ("state", state.as_str()),
                ("nonce", nonce.as_str()),
            ],
        )
        .map_err(|err| OidcError::InvalidClaim(format!("authorization endpoint: {err}")))?;

        debug!(%tenant, provider, "federated login started");
        Ok(Authorization {
            redirect: redirect.into(),
            cookies: vec![
                self.signer.cookie(STATE_COOKIE, &state)?,
                self.signer.cookie(NONCE_COOKIE, &nonce)?,
            ],
        })
    }

    /// Finish a federated login and start a session.
    ///
    /// # Errors
    /// See [`OidcError`]; the state check runs before anything reaches the
    /// provider.
    pub async fn callback(
        &self,
        conn: &mut dyn StoreConnection,
        sessions: &SessionManager,
        tenant: TenantId,
        provider: &str,
        query: &CallbackQuery,
        headers: &HeaderMap,
    ) -> Result<FederatedLogin, OidcError> {
        let expected_state = self.signed_cookie(headers, STATE_COOKIE);
        match (query.state.as_deref(), expected_state.as_deref()) {
            (Some(state), Some(expected))
                if cookies::constant_time_eq(state.as_bytes(), expected.as_bytes()) => {}
            _ => return Err(OidcError::StateMismatch),
        }
        if let Some(error) = &query.error {
            return Err(OidcError::ProviderError(error.clone()));
        }
        let code = query.code.as_deref().ok_or(OidcError::MissingCode)?;

        let config = self.provider_config(conn, tenant, provider).await?;
        let metadata = self.provider.metadata(&config.issuer).await?;
        let id_token = self.provider.exchange_code(&config, &metadata, code).await?;
        let claims = self
            .provider
            .verify_id_token(&config, &metadata, &id_token)
            .await?;

        let expected_nonce = self.signed_cookie(headers, NONCE_COOKIE);
        match (claims.nonce.as_deref(), expected_nonce.as_deref()) {
            (Some(nonce), Some(expected))
                if cookies::constant_time_eq(nonce.as_bytes(), expected.as_bytes()) => {}
            _ => return Err(OidcError::NonceMismatch),
        }

        let email = claims
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .filter(|_| claims.email_verified != Some(false))
            .ok_or(OidcError::MissingEmail)?
            .to_lowercase();

        let user = self.federated_user(conn, tenant, &email, &claims).await?;
        let session = sessions
            .begin(conn, user.user_id, sessions.expiry()?)
            .await?;
        info!(%tenant, provider, user_id = %user.user_id, "federated login");

        Ok(FederatedLogin {
            user_id: user.user_id,
            landing_path: user.landing_path,
            cookies: vec![
                session.header,
                cookies::expired_cookie(STATE_COOKIE)?,
                cookies::expired_cookie(NONCE_COOKIE)?,
            ],
        })
    }

    fn signed_cookie(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        cookie_value(headers, name).and_then(|value| self.signer.verify(&value))
    }

    /// The local user for `email`, created on first login.
    async fn federated_user(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        email: &str,
        claims: &IdTokenClaims,
    ) -> Result<FederatedUser, OidcError> {
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_email", email);
        let mut users: Vec<FederatedUser> = store::query(conn, USER_BY_EMAIL, &params).await?;
        match users.len() {
            0 => {
                let params = params
                    .bind("p_display_name", claims.name.clone())
                    .bind("p_issuer", claims.iss.as_str())
                    .bind("p_subject", claims.sub.as_str());
                let created: Vec<FederatedUser> =
                    store::call_as(conn, PROVISION_FEDERATED_USER, &params).await?;
                let user = created.into_iter().next().ok_or_else(|| {
                    OidcError::Invariant(format!("{PROVISION_FEDERATED_USER} returned no user"))
                })?;
                info!(%tenant, user_id = %user.user_id, "federated user provisioned");
                Ok(user)
            }
            1 => users
                .pop()
                .ok_or_else(|| OidcError::Invariant("user vanished".to_string())),
            count => Err(OidcError::Invariant(format!(
                "{count} users share one email"
            ))),
        }
    }
}
