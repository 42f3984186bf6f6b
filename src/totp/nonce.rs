//! Short-lived nonce bridging a password login and its second factor.
//!
//! The nonce is handed to the client after the password check; only its hash
//! is stored. Taking it back deletes it, so every nonce is good for exactly
//! one code attempt.

use super::{SecondFactor, TotpService};
use crate::{
    error::GateError,
    store::{self, Params, StoreConnection},
};
use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

const MFA_NONCE_BEGIN: &str = "portier.mfa_nonce_begin";
const MFA_NONCE_TAKE: &str = "portier.mfa_nonce_take";

/// How long a nonce stays redeemable.
pub const NONCE_TTL_MINUTES: i64 = 5;

#[derive(Debug, Deserialize)]
struct NonceRow {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    landing_path: Option<String>,
}

fn generate_nonce() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate MFA nonce")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn hash_nonce(nonce: &str) -> Vec<u8> {
    Sha256::digest(nonce.as_bytes()).to_vec()
}

impl TotpService {
    /// Mint a nonce for `user_id` that can be redeemed once within
    /// [`NONCE_TTL_MINUTES`]. The landing page travels with the nonce.
    ///
    /// # Errors
    /// Returns an error if the random source or the store call fails.
    pub async fn begin_nonce(
        &self,
        conn: &mut dyn StoreConnection,
        user_id: Uuid,
        landing_path: Option<&str>,
    ) -> Result<String, GateError> {
        let nonce = generate_nonce()?;
        let expires_at = Utc::now() + Duration::minutes(NONCE_TTL_MINUTES);
        let params = Params::new()
            .bind("p_nonce_hash", hash_nonce(&nonce))
            .bind("p_user_id", user_id)
            .bind("p_landing_path", landing_path)
            .bind("p_expires_at", expires_at);
        store::call(conn, MFA_NONCE_BEGIN, &params, &[]).await?;
        debug!(%user_id, %expires_at, "mfa nonce issued");
        Ok(nonce)
    }

    /// Consume `nonce` and check `code` for the user it was issued to.
    ///
    /// The nonce is gone afterwards whatever the outcome.
    ///
    /// # Errors
    /// Returns store errors.
    pub async fn redeem_nonce(
        &self,
        conn: &mut dyn StoreConnection,
        nonce: &str,
        code: &str,
    ) -> Result<Option<SecondFactor>, GateError> {
        let params = Params::new().bind("p_nonce_hash", hash_nonce(nonce));
        let rows: Vec<NonceRow> = store::call_as(conn, MFA_NONCE_TAKE, &params).await?;
        let Some(row) = rows.into_iter().next() else {
            debug!("unknown mfa nonce");
            return Ok(None);
        };
        if row.expires_at <= Utc::now() {
            debug!(user_id = %row.user_id, "expired mfa nonce");
            return Ok(None);
        }

        if !self.verify_user(conn, row.user_id, code).await? {
            return Ok(None);
        }
        Ok(Some(SecondFactor {
            user_id: row.user_id,
            landing_path: row.landing_path,
        }))
    }
}
