//! Relying-party policy per tenant.
//!
//! Policies are read once at boot. Each one carries a ready `Webauthn`
//! instance bound to the tenant's RP id and origin, plus the knobs that shape
//! the options sent to the browser.

use crate::{
    session,
    store::{self, Params, StoreConnection},
    tenant::TenantId,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::{Webauthn, WebauthnBuilder};

const WEBAUTHN_POLICIES: &str = "portier.webauthn_policies";

/// COSE algorithms the passkey ceremonies can verify: ES256 and RS256.
pub const SUPPORTED_ALGORITHMS: [i64; 2] = [-7, -257];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attachment {
    Platform,
    CrossPlatform,
}

/// Shared shape of `residentKey` and `userVerification`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Discouraged,
    Preferred,
    Required,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conveyance {
    None,
    Indirect,
    Direct,
    Enterprise,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasskeyPolicy {
    pub rp_id: String,
    pub rp_name: String,
    pub rp_origin: Url,
    pub attachment: Option<Attachment>,
    pub resident_key: Requirement,
    pub user_verification: Requirement,
    pub attestation: Conveyance,
    /// COSE algorithm ids offered to the authenticator, in preference order.
    pub algorithms: Vec<i64>,
    pub challenge_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct PolicyRow {
    tenant_id: Uuid,
    rp_id: String,
    rp_name: Option<String>,
    rp_origin: String,
    authenticator_attachment: Option<Attachment>,
    resident_key: Option<Requirement>,
    user_verification: Option<Requirement>,
    attestation: Option<Conveyance>,
    algorithms: Option<Vec<i64>>,
    challenge_ttl_seconds: Option<i64>,
}

impl PasskeyPolicy {
    fn from_row(row: PolicyRow, default_ttl: Duration) -> Result<Self> {
        let rp_origin = Url::parse(&row.rp_origin)
            .with_context(|| format!("Invalid passkey origin: {}", row.rp_origin))?;
        let algorithms = row
            .algorithms
            .unwrap_or_else(|| SUPPORTED_ALGORITHMS.to_vec());
        if !algorithms
            .iter()
            .any(|alg| SUPPORTED_ALGORITHMS.contains(alg))
        {
            bail!(
                "tenant {} allows no supported passkey algorithm ({algorithms:?})",
                row.tenant_id
            );
        }
        let challenge_ttl = match row.challenge_ttl_seconds.filter(|seconds| *seconds > 0) {
            Some(seconds) => session::lifetime(seconds).with_context(|| {
                format!("tenant {} has an invalid passkey challenge TTL", row.tenant_id)
            })?,
            None => default_ttl,
        };

        Ok(Self {
            rp_name: row.rp_name.unwrap_or_else(|| row.rp_id.clone()),
            rp_id: row.rp_id,
            rp_origin,
            attachment: row.authenticator_attachment,
            resident_key: row.resident_key.unwrap_or(Requirement::Preferred),
            user_verification: row.user_verification.unwrap_or(Requirement::Required),
            attestation: row.attestation.unwrap_or(Conveyance::None),
            algorithms,
            challenge_ttl,
        })
    }

    /// Rewrite `publicKey` creation options to follow this policy.
    pub fn apply_creation(&self, options: &mut Value) {
        let Some(public_key) = options.get_mut("publicKey").and_then(Value::as_object_mut) else {
            return;
        };

        let mut selection = json!({
            "residentKey": self.resident_key,
            "requireResidentKey": self.resident_key == Requirement::Required,
            "userVerification": self.user_verification,
        });
        if let (Some(attachment), Some(selection)) =
            (self.attachment, selection.as_object_mut())
        {
            selection.insert("authenticatorAttachment".to_string(), json!(attachment));
        }
        public_key.insert("authenticatorSelection".to_string(), selection);
        public_key.insert("attestation".to_string(), json!(self.attestation));

        if let Some(params) = public_key
            .get_mut("pubKeyCredParams")
            .and_then(Value::as_array_mut)
        {
            params.retain(|param| {
                param
                    .get("alg")
                    .and_then(Value::as_i64)
                    .is_some_and(|alg| self.algorithms.contains(&alg))
            });
            params.sort_by_key(|param| {
                param
                    .get("alg")
                    .and_then(Value::as_i64)
                    .and_then(|alg| self.algorithms.iter().position(|allowed| *allowed == alg))
            });
        }
    }

    /// Rewrite `publicKey` request options to follow this policy.
    pub fn apply_request(&self, options: &mut Value) {
        if let Some(public_key) = options.get_mut("publicKey").and_then(Value::as_object_mut) {
            public_key.insert(
                "userVerification".to_string(),
                json!(self.user_verification),
            );
        }
    }
}

/// A tenant's policy with the relying party built from it.
pub struct TenantPasskeys {
    pub policy: PasskeyPolicy,
    pub webauthn: Webauthn,
}

/// Passkey policies of every tenant that enabled passkeys. Immutable after boot.
#[derive(Default)]
pub struct PasskeyPolicies {
    by_tenant: HashMap<TenantId, TenantPasskeys>,
}

impl PasskeyPolicies {
    /// Load every tenant's policy.
    ///
    /// # Errors
    /// Fails on store errors, a bad origin, an unusable algorithm list or a
    /// tenant listed twice.
    pub async fn load(conn: &mut dyn StoreConnection, default_ttl: Duration) -> Result<Self> {
        let rows: Vec<PolicyRow> = store::query(conn, WEBAUTHN_POLICIES, &Params::new())
            .await
            .context("Failed to load passkey policies")?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in rows {
            let tenant = TenantId(row.tenant_id);
            policies.push((tenant, PasskeyPolicy::from_row(row, default_ttl)?));
        }
        let loaded = Self::from_policies(policies)?;
        info!(tenants = loaded.len(), "passkey policies loaded");
        Ok(loaded)
    }

    /// # Errors
    /// Fails when a relying party cannot be built or a tenant appears twice.
    pub fn from_policies<I>(policies: I) -> Result<Self>
    where
        I: IntoIterator<Item = (TenantId, PasskeyPolicy)>,
    {
        let mut by_tenant = HashMap::new();
        for (tenant, policy) in policies {
            if policy.user_verification != Requirement::Required {
                warn!(
                    %tenant,
                    "passkey user verification is always enforced; the weaker preference only reaches the browser"
                );
            }
            let webauthn = WebauthnBuilder::new(&policy.rp_id, &policy.rp_origin)
                .map_err(|err| anyhow!("Invalid relying party for tenant {tenant}: {err}"))?
                .rp_name(&policy.rp_name)
                .build()
                .map_err(|err| anyhow!("Invalid relying party for tenant {tenant}: {err}"))?;
            if by_tenant
                .insert(tenant, TenantPasskeys { policy, webauthn })
                .is_some()
            {
                bail!("tenant {tenant} has more than one passkey policy");
            }
        }
        Ok(Self { by_tenant })
    }

    #[must_use]
    pub fn get(&self, tenant: TenantId) -> Option<&TenantPasskeys> {
        self.by_tenant.get(&tenant)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tenant.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tenant.is_empty()
    }
}
