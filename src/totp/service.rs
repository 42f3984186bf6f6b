use crate::{
    error::GateError,
    store::{self, Params, StoreConnection},
};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

const TOTP_ENROLL: &str = "portier.totp_enroll";
const TOTP_PENDING: &str = "portier.totp_pending";
const TOTP_CONFIRM: &str = "portier.totp_confirm";
const TOTP_SECRET: &str = "portier.totp_secret";

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

/// What the user needs to add the account to an authenticator app. Sent once.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Provisioning {
    pub enrollment_id: Uuid,
    pub secret: String,
    /// PNG data URL of the `otpauth://` QR code.
    pub qr_code_url: String,
}

/// A user who passed their second factor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondFactor {
    pub user_id: Uuid,
    pub landing_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PendingRow {
    user_id: Uuid,
    secret: String,
    #[serde(default)]
    landing_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretRow {
    secret: String,
}

#[derive(Clone, Debug)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into().replace(':', " "),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Begins enrollment: generates a secret, stores it under a new pending
    /// enrollment id and returns the provisioning data.
    ///
    /// # Errors
    /// Returns an error if secret generation, QR rendering or the store call fails.
    pub async fn enroll(
        &self,
        conn: &mut dyn StoreConnection,
        user_id: Uuid,
        account: &str,
    ) -> Result<Provisioning, GateError> {
        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|err| anyhow!("Secret gen error: {err:?}"))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.clone()),
            account.replace(':', "_"),
        )
        .map_err(|err| anyhow!("TOTP init error: {err}"))?;

        let qr = totp
            .get_qr_base64()
            .map_err(|err| anyhow!("QR gen error: {err}"))?;
        let secret = totp.get_secret_base32();
        let enrollment_id = Uuid::new_v4();

        let params = Params::new()
            .bind("p_user_id", user_id)
            .bind("p_enrollment_id", enrollment_id)
            .bind("p_secret", secret.as_str());
        store::call(conn, TOTP_ENROLL, &params, &[]).await?;
        debug!(%user_id, %enrollment_id, "totp enrollment started");

        Ok(Provisioning {
            enrollment_id,
            secret,
            qr_code_url: format!("data:image/png;base64,{qr}"),
        })
    }

    /// Confirms a pending enrollment with its first code and returns the
    /// enrolled user with their landing page. `Ok(None)` for an unknown
    /// enrollment or a wrong code.
    ///
    /// # Errors
    /// Returns store errors.
    pub async fn confirm(
        &self,
        conn: &mut dyn StoreConnection,
        enrollment_id: Uuid,
        code: &str,
    ) -> Result<Option<SecondFactor>, GateError> {
        let params = Params::new().bind("p_enrollment_id", enrollment_id);
        let rows: Vec<PendingRow> = store::query(conn, TOTP_PENDING, &params).await?;
        let Some(pending) = rows.into_iter().next() else {
            return Ok(None);
        };

        if !check_code(&pending.secret, code, unix_now()?)? {
            return Ok(None);
        }

        store::call(conn, TOTP_CONFIRM, &params, &[]).await?;
        debug!(user_id = %pending.user_id, %enrollment_id, "totp enrollment confirmed");
        Ok(Some(SecondFactor {
            user_id: pending.user_id,
            landing_path: pending.landing_path,
        }))
    }

    /// Check a code against the user's confirmed secrets.
    ///
    /// # Errors
    /// Returns store errors.
    pub async fn verify_user(
        &self,
        conn: &mut dyn StoreConnection,
        user_id: Uuid,
        code: &str,
    ) -> Result<bool, GateError> {
        let params = Params::new().bind("p_user_id", user_id);
        let rows: Vec<SecretRow> = store::query(conn, TOTP_SECRET, &params).await?;
        let now = unix_now()?;
        for row in rows {
            if check_code(&row.secret, code, now)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Check a 6-digit code against a base32 secret at `unix_time`, allowing one
/// step of clock skew either way.
///
/// # Errors
/// Returns an error if the stored secret is not valid base32 or too short.
pub fn check_code(secret_base32: &str, code: &str, unix_time: u64) -> Result<bool> {
    let code = code.trim();
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    let totp = totp_for(secret_base32)?;
    Ok(totp.check(code, unix_time))
}

/// Code for `unix_time`; used by enrollment tooling and tests.
///
/// # Errors
/// Returns an error if the secret is not valid base32 or too short.
pub fn code_at(secret_base32: &str, unix_time: u64) -> Result<String> {
    Ok(totp_for(secret_base32)?.generate(unix_time))
}

fn totp_for(secret_base32: &str) -> Result<TOTP> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|err| anyhow!("invalid TOTP secret: {err:?}"))?;
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECONDS,
        secret,
        None,
        String::new(),
    )
    .map_err(|err| anyhow!("TOTP init error: {err}"))
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
