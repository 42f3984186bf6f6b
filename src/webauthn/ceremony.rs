use super::policy::{PasskeyPolicies, TenantPasskeys};
use crate::{
    error::{DenialReason, GateError},
    password, session,
    store::{self, CallOutcome, Params, StoreConnection, StoreError, UNIQUE_VIOLATION},
    tenant::TenantId,
};
use anyhow::{Context, anyhow};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use webauthn_rs::prelude::{
    Passkey, PasskeyAuthentication, PasskeyRegistration, PublicKeyCredential,
    RegisterPublicKeyCredential, WebauthnError,
};

const SAVE_REGISTRATION: &str = "portier.webauthn_save_registration";
const TAKE_REGISTRATION: &str = "portier.webauthn_take_registration";
const SAVE_CREDENTIAL: &str = "portier.webauthn_save_credential";
const CREDENTIALS: &str = "portier.webauthn_credentials";
const SAVE_AUTHENTICATION: &str = "portier.webauthn_save_authentication";
const TAKE_AUTHENTICATION: &str = "portier.webauthn_take_authentication";
const RECORD_USE: &str = "portier.webauthn_record_use";

#[derive(Debug, Error)]
pub enum CeremonyError {
    #[error("passkeys are not configured for tenant {0}")]
    NotConfigured(TenantId),
    #[error("username is not eligible for passkey registration")]
    UsernameUnavailable,
    #[error("no passkeys registered for this username")]
    NoCredentials,
    #[error("no pending ceremony")]
    NoPendingCeremony,
    #[error("ceremony expired")]
    Expired,
    #[error("malformed client data")]
    MalformedClientData,
    #[error("authenticator counter went backwards")]
    CloneWarning,
    #[error("verification failed: {0}")]
    Verification(WebauthnError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<CeremonyError> for GateError {
    fn from(err: CeremonyError) -> Self {
        match err {
            CeremonyError::NotConfigured(tenant) => {
                Self::Config(format!("passkeys are not configured for tenant {tenant}"))
            }
            CeremonyError::CloneWarning => Self::Denied(DenialReason::CloneWarning),
            CeremonyError::Store(err) => Self::Store(err),
            CeremonyError::Gate(err) => err,
            CeremonyError::Internal(err) => Self::Internal(err),
            rejected => {
                debug!(reason = %rejected, "passkey ceremony rejected");
                Self::Denied(DenialReason::CeremonyRejected)
            }
        }
    }
}

/// A passkey registration that created an account.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Registered {
    pub user_id: Uuid,
    #[serde(default)]
    pub landing_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AuthenticationOutcome {
    pub user_id: Uuid,
    #[serde(default)]
    pub landing_path: Option<String>,
    /// The store saw a sign counter lower than the last one recorded.
    #[serde(default, rename = "counter_regressed")]
    pub clone_warning: bool,
}

#[derive(Debug, Deserialize)]
struct PendingRegistration {
    user_handle: Uuid,
    state: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PendingAuthentication {
    state: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CredentialRow {
    passkey: Value,
}

/// Columns persisted next to the serialised passkey.
#[derive(Debug, PartialEq, Eq)]
struct CredentialRecord {
    credential_id: String,
    attestation_format: Option<String>,
    transports: Vec<String>,
    backup_eligible: bool,
    backup_state: bool,
    sign_count: i64,
}

impl CredentialRecord {
    fn from_passkey(passkey: &Value) -> Result<Self, CeremonyError> {
        let cred = passkey
            .get("cred")
            .ok_or_else(|| anyhow!("serialised passkey has no credential"))?;
        let credential_id = cred
            .get("cred_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("serialised passkey has no credential id"))?
            .to_string();
        let text = |value: &Value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        };
        Ok(Self {
            credential_id,
            attestation_format: cred.get("attestation_format").and_then(text),
            transports: cred
                .get("transports")
                .and_then(Value::as_array)
                .map(|transports| transports.iter().filter_map(text).collect())
                .unwrap_or_default(),
            backup_eligible: cred
                .get("backup_eligible")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            backup_state: cred
                .get("backup_state")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            sign_count: cred.get("counter").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Passkey registration and authentication with state kept in the store.
pub struct PasskeyService {
    policies: PasskeyPolicies,
}

impl PasskeyService {
    #[must_use]
    pub fn new(policies: PasskeyPolicies) -> Self {
        Self { policies }
    }

    #[must_use]
    pub fn policies(&self) -> &PasskeyPolicies {
        &self.policies
    }

    fn tenant(&self, tenant: TenantId) -> Result<&TenantPasskeys, CeremonyError> {
        self.policies
            .get(tenant)
            .ok_or(CeremonyError::NotConfigured(tenant))
    }

    /// Start registering a passkey for a new account called `username`.
    ///
    /// Returns the creation options for `navigator.credentials.create`.
    ///
    /// # Errors
    /// Rejects taken usernames; returns store and library errors.
    pub async fn register_begin(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        username: &str,
    ) -> Result<Value, CeremonyError> {
        let rp = self.tenant(tenant)?;
        let username = username.trim();
        if !password::valid_username(username) {
            return Err(GateError::BadRequest("Invalid username".to_string()).into());
        }
        if password::find_login_record(conn, tenant, username)
            .await?
            .is_some()
        {
            return Err(CeremonyError::UsernameUnavailable);
        }

        let user_handle = Uuid::new_v4();
        let (challenge, registration) = rp
            .webauthn
            .start_passkey_registration(user_handle, username, username, None)
            .map_err(CeremonyError::Verification)?;

        let mut options =
            serde_json::to_value(&challenge).context("Failed to serialise creation options")?;
        rp.policy.apply_creation(&mut options);
        let state =
            serde_json::to_value(&registration).context("Failed to serialise registration")?;

        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username)
            .bind("p_user_handle", user_handle)
            .bind("p_state", state)
            .bind("p_expires_at", session::deadline(rp.policy.challenge_ttl)?);
        store::call(conn, SAVE_REGISTRATION, &params, &[]).await?;
        debug!(%tenant, "passkey registration started");

        Ok(options)
    }

    /// Verify the authenticator's attestation and create the account.
    ///
    /// The pending state is consumed whatever the outcome.
    ///
    /// # Errors
    /// See [`CeremonyError`].
    pub async fn register_finish(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        username: &str,
        response: &RegisterPublicKeyCredential,
    ) -> Result<Registered, CeremonyError> {
        let rp = self.tenant(tenant)?;
        let username = username.trim();
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username);
        let pending: Vec<PendingRegistration> =
            store::call_as(conn, TAKE_REGISTRATION, &params).await?;
        let pending = pending
            .into_iter()
            .next()
            .ok_or(CeremonyError::NoPendingCeremony)?;
        if pending.expires_at <= Utc::now() {
            return Err(CeremonyError::Expired);
        }

        let registration: PasskeyRegistration = serde_json::from_value(pending.state)
            .context("Failed to restore registration state")?;
        let passkey = rp
            .webauthn
            .finish_passkey_registration(response, &registration)
            .map_err(CeremonyError::Verification)?;

        let passkey = serde_json::to_value(&passkey).context("Failed to serialise passkey")?;
        let record = CredentialRecord::from_passkey(&passkey)?;
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username)
            .bind("p_user_handle", pending.user_handle)
            .bind("p_credential_id", record.credential_id)
            .bind("p_passkey", passkey)
            .bind("p_attestation_format", record.attestation_format)
            .bind("p_transports", record.transports)
            .bind("p_backup_eligible", record.backup_eligible)
            .bind("p_backup_state", record.backup_state)
            .bind("p_sign_count", record.sign_count);

        match store::call(conn, SAVE_CREDENTIAL, &params, &[UNIQUE_VIOLATION]).await? {
            CallOutcome::Tolerated(_) => Err(CeremonyError::UsernameUnavailable),
            CallOutcome::Rows(rows) => store::decode_rows::<Registered>(SAVE_CREDENTIAL, rows)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    GateError::Invariant(format!("{SAVE_CREDENTIAL} returned no user")).into()
                }),
        }
    }

    /// Start a passkey login for `username`.
    ///
    /// Returns the request options for `navigator.credentials.get`.
    ///
    /// # Errors
    /// See [`CeremonyError`].
    pub async fn authenticate_begin(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        username: &str,
    ) -> Result<Value, CeremonyError> {
        let rp = self.tenant(tenant)?;
        let username = username.trim();
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username);
        let rows: Vec<CredentialRow> = store::query(conn, CREDENTIALS, &params).await?;
        let passkeys = rows
            .into_iter()
            .map(|row| serde_json::from_value::<Passkey>(row.passkey))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to restore stored passkeys")?;
        if passkeys.is_empty() {
            return Err(CeremonyError::NoCredentials);
        }

        let (challenge, authentication) = rp
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(CeremonyError::Verification)?;

        let mut options =
            serde_json::to_value(&challenge).context("Failed to serialise request options")?;
        let challenge = options
            .pointer("/publicKey/challenge")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("request options carry no challenge"))?;
        rp.policy.apply_request(&mut options);
        let state = serde_json::to_value(&authentication)
            .context("Failed to serialise authentication")?;

        let params = params
            .bind("p_challenge", challenge)
            .bind("p_state", state)
            .bind("p_expires_at", session::deadline(rp.policy.challenge_ttl)?);
        store::call(conn, SAVE_AUTHENTICATION, &params, &[]).await?;
        debug!(%tenant, "passkey authentication started");

        Ok(options)
    }

    /// Verify an assertion and record the credential's use. The passkey is
    /// written back with its updated counter and backup state.
    ///
    /// The pending state is looked up by the challenge the browser signed, so
    /// an assertion for any other challenge finds nothing.
    ///
    /// # Errors
    /// See [`CeremonyError`].
    pub async fn authenticate_finish(
        &self,
        conn: &mut dyn StoreConnection,
        tenant: TenantId,
        username: &str,
        response: &PublicKeyCredential,
    ) -> Result<AuthenticationOutcome, CeremonyError> {
        let rp = self.tenant(tenant)?;
        let challenge = client_challenge(response)?;
        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username.trim())
            .bind("p_challenge", challenge);
        let pending: Vec<PendingAuthentication> =
            store::call_as(conn, TAKE_AUTHENTICATION, &params).await?;
        let pending = pending
            .into_iter()
            .next()
            .ok_or(CeremonyError::NoPendingCeremony)?;
        if pending.expires_at <= Utc::now() {
            return Err(CeremonyError::Expired);
        }

        let lookup = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_username", username.trim());
        let stored: Vec<CredentialRow> = store::query(conn, CREDENTIALS, &lookup).await?;
        if stored.is_empty() {
            return Err(CeremonyError::NoCredentials);
        }

        let authentication: PasskeyAuthentication = serde_json::from_value(pending.state)
            .context("Failed to restore authentication state")?;
        let result = match rp
            .webauthn
            .finish_passkey_authentication(response, &authentication)
        {
            Ok(result) => result,
            Err(WebauthnError::CredentialPossibleCompromise) => {
                return Err(CeremonyError::CloneWarning);
            }
            Err(err) => return Err(CeremonyError::Verification(err)),
        };

        let credential_id = serde_json::to_value(result.cred_id())
            .ok()
            .and_then(|value| value.as_str().map(ToString::to_string))
            .ok_or_else(|| anyhow!("credential id does not serialise as text"))?;
        let stored =
            stored_passkey(stored, &credential_id)?.ok_or(CeremonyError::NoCredentials)?;
        let mut passkey: Passkey =
            serde_json::from_value(stored).context("Failed to restore stored passkey")?;
        if passkey.update_credential(&result) == Some(true) {
            debug!(%tenant, %credential_id, "passkey counter or backup state updated");
        }
        let passkey = serde_json::to_value(&passkey).context("Failed to serialise passkey")?;

        let params = Params::new()
            .bind("p_tenant_id", tenant.0)
            .bind("p_credential_id", credential_id)
            .bind("p_passkey", passkey)
            .bind("p_sign_count", result.counter())
            .bind("p_user_verified", result.user_verified())
            .bind("p_backup_state", result.backup_state());
        let outcome: Vec<AuthenticationOutcome> =
            store::call_as(conn, RECORD_USE, &params).await?;
        outcome
            .into_iter()
            .next()
            .ok_or(CeremonyError::NoCredentials)
    }
}

/// The stored passkey with `credential_id`, as serialised.
fn stored_passkey(
    rows: Vec<CredentialRow>,
    credential_id: &str,
) -> Result<Option<Value>, CeremonyError> {
    for row in rows {
        if CredentialRecord::from_passkey(&row.passkey)?.credential_id == credential_id {
            return Ok(Some(row.passkey));
        }
    }
    Ok(None)
}

/// The challenge inside the assertion's `clientDataJSON`.
fn client_challenge(response: &PublicKeyCredential) -> Result<String, CeremonyError> {
    let raw = serde_json::to_value(response).map_err(|_| CeremonyError::MalformedClientData)?;
    let encoded = raw
        .pointer("/response/clientDataJSON")
        .and_then(Value::as_str)
        .ok_or(CeremonyError::MalformedClientData)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| CeremonyError::MalformedClientData)?;
    let client_data: Value =
        serde_json::from_slice(&decoded).map_err(|_| CeremonyError::MalformedClientData)?;
    client_data
        .get("challenge")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or(CeremonyError::MalformedClientData)
}
