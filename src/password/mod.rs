//! Password registration and login.
//!
//! Passwords are checked against the tenant's policy, which is read from the
//! store on every attempt, and kept as Argon2id PHC strings. Login runs a
//! verification even for unknown usernames so both paths cost the same.

use crate::{
    error::GateError,
    store::{self, CallOutcome, Params, StoreConnection, UNIQUE_VIOLATION},
    tenant::TenantId,
};
use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const TENANT_AUTH_POLICY: &str = "portier.tenant_auth_policy";
const REGISTER_USER: &str = "portier.register_user";
const LOGIN_RECORD: &str = "portier.login_record";

/// Hash verified when the username is unknown.
static DUMMY_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("portier-timing-equalizer").ok());

/// Compiled once; `None` only if the pattern itself is broken.
static USERNAME_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._@+-]{1,128}$").ok());

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_symbol: bool,
    pub require_digit: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_symbol: false,
            require_digit: false,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("Password must be at least {0} characters long")]
    TooShort(usize),
    #[error("Password must be at most {0} characters long")]
    TooLong(usize),
    #[error("Password must contain a symbol")]
    MissingSymbol,
    #[error("Password must contain a digit")]
    MissingDigit,
    #[error("Passwords do not match")]
    ConfirmationMismatch,
}

impl PasswordPolicy {
    /// Every rule the password breaks, in a stable order.
    ///
    /// # Errors
    /// Returns the list of violations when there is at least one.
    pub fn check(&self, password: &str) -> Result<(), Vec<PolicyViolation>> {
        let length = password.chars().count();
        let mut violations = Vec::new();
        if length < self.min_length {
            violations.push(PolicyViolation::TooShort(self.min_length));
        }
        if length > self.max_length {
            violations.push(PolicyViolation::TooLong(self.max_length));
        }
        if self.require_symbol
            && !password
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            violations.push(PolicyViolation::MissingSymbol);
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingDigit);
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Authentication policy of a tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantAuthPolicy {
    pub password: PasswordPolicy,
    pub mfa_required: bool,
}

#[derive(Debug, Deserialize)]
struct AuthPolicyRow {
    min_length: Option<i64>,
    max_length: Option<i64>,
    #[serde(default)]
    require_symbol: bool,
    #[serde(default)]
    require_digit: bool,
    #[serde(default)]
    mfa_required: bool,
}

impl From<AuthPolicyRow> for TenantAuthPolicy {
    fn from(row: AuthPolicyRow) -> Self {
        let defaults = PasswordPolicy::default();
        let length = |value: Option<i64>, fallback: usize| {
            value
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(fallback)
        };
        Self {
            password: PasswordPolicy {
                min_length: length(row.min_length, defaults.min_length),
                max_length: length(row.max_length, defaults.max_length),
                require_symbol: row.require_symbol,
                require_digit: row.require_digit,
            },
            mfa_required: row.mfa_required,
        }
    }
}

/// Read the tenant's authentication policy.
///
/// # Errors
/// A tenant without exactly one policy row is a configuration fault.
pub async fn load_policy(
    conn: &mut dyn StoreConnection,
    tenant: TenantId,
) -> Result<TenantAuthPolicy, GateError> {
    let params = Params::new().bind("p_tenant_id", tenant.0);
    let mut rows: Vec<AuthPolicyRow> = store::query(conn, TENANT_AUTH_POLICY, &params).await?;
    match (rows.pop(), rows.is_empty()) {
        (Some(row), true) => Ok(row.into()),
        _ => Err(GateError::Config(format!(
            "tenant {tenant} must have exactly one authentication policy"
        ))),
    }
}

/// Hash a password as an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Verify against `stored_hash`, or burn an equivalent amount of work and
/// fail when there is none.
#[must_use]
pub fn verify_or_burn(password: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = verify_password(password, dummy);
            }
            false
        }
    }
}

/// Usernames: 1 to 128 visible characters without separators.
#[must_use]
pub fn valid_username(username: &str) -> bool {
    USERNAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(username))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub user_id: Uuid,
    pub mfa_required: bool,
}

#[derive(Debug, Deserialize)]
struct RegisteredRow {
    user_id: Uuid,
}

/// Register `username` with a password.
///
/// # Errors
/// Returns [`GateError::BadRequest`] for invalid input or policy violations,
/// [`GateError::Conflict`] when the username is taken, and store errors.
pub async fn register(
    conn: &mut dyn StoreConnection,
    tenant: TenantId,
    username: &str,
    password: &str,
    confirmation: &str,
) -> Result<Registration, GateError> {
    let username = username.trim();
    if !valid_username(username) {
        return Err(GateError::BadRequest("Invalid username".to_string()));
    }

    let policy = load_policy(conn, tenant).await?;
    let mut violations = policy.password.check(password).err().unwrap_or_default();
    if password != confirmation {
        violations.push(PolicyViolation::ConfirmationMismatch);
    }
    if !violations.is_empty() {
        let message = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(". ");
        return Err(GateError::BadRequest(message));
    }

    let password = password.to_string();
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("password hashing task failed")??;

    let params = Params::new()
        .bind("p_tenant_id", tenant.0)
        .bind("p_username", username)
        .bind("p_password_hash", password_hash);
    match store::call(conn, REGISTER_USER, &params, &[UNIQUE_VIOLATION]).await? {
        CallOutcome::Tolerated(_) => {
            debug!(%tenant, "registration conflict");
            Err(GateError::Conflict("Username is not available".to_string()))
        }
        CallOutcome::Rows(rows) => {
            let row = store::decode_rows::<RegisteredRow>(REGISTER_USER, rows)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    GateError::Invariant(format!("{REGISTER_USER} returned no user"))
                })?;
            Ok(Registration {
                user_id: row.user_id,
                mfa_required: policy.mfa_required,
            })
        }
    }
}

/// What a successful password check yields.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoginRecord {
    pub user_id: Uuid,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub mfa_enrolled: bool,
    #[serde(default)]
    pub landing_path: Option<String>,
}

/// Look up `username` and check `password`.
///
/// # Errors
/// Returns store errors and [`GateError::Invariant`] when the username is
/// ambiguous. A wrong password or unknown user is `Ok(None)`.
pub async fn authenticate(
    conn: &mut dyn StoreConnection,
    tenant: TenantId,
    username: &str,
    password: &str,
) -> Result<Option<LoginRecord>, GateError> {
    let record = find_login_record(conn, tenant, username.trim()).await?;
    let stored_hash = record
        .as_ref()
        .and_then(|record| record.password_hash.clone());

    let password = password.to_string();
    let verified = tokio::task::spawn_blocking(move || {
        verify_or_burn(&password, stored_hash.as_deref())
    })
    .await
    .context("password verification task failed")?;

    Ok(record.filter(|_| verified))
}

/// The login record for `username`, if the user exists.
///
/// # Errors
/// Returns store errors and [`GateError::Invariant`] for duplicate users.
pub async fn find_login_record(
    conn: &mut dyn StoreConnection,
    tenant: TenantId,
    username: &str,
) -> Result<Option<LoginRecord>, GateError> {
    let params = Params::new()
        .bind("p_tenant_id", tenant.0)
        .bind("p_username", username);
    let mut rows: Vec<LoginRecord> = store::query(conn, LOGIN_RECORD, &params).await?;
    if rows.len() > 1 {
        return Err(GateError::Invariant(format!(
            "{} users share one username",
            rows.len()
        )));
    }
    Ok(rows.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn strict() -> PasswordPolicy {
        PasswordPolicy {
            min_length: 8,
            max_length: 64,
            require_symbol: true,
            require_digit: true,
        }
    }

    fn policy_store(mfa_required: bool) -> MemoryStore {
        MemoryStore::new().rows(
            TENANT_AUTH_POLICY,
            vec![json!({
                "min_length": 8,
                "max_length": 64,
                "require_symbol": true,
                "require_digit": true,
                "mfa_required": mfa_required,
            })],
        )
    }

    #[test]
    fn policy_accepts_compliant_password() {
        assert_eq!(strict().check("P@ss1234"), Ok(()));
    }

    #[test]
    fn policy_reports_every_violation() {
        assert_eq!(
            strict().check("abc"),
            Err(vec![
                PolicyViolation::TooShort(8),
                PolicyViolation::MissingSymbol,
                PolicyViolation::MissingDigit,
            ])
        );
        assert_eq!(
            strict().check(&format!("{}1!", "a".repeat(70))),
            Err(vec![PolicyViolation::TooLong(64)])
        );
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let policy = PasswordPolicy {
            min_length: 4,
            ..PasswordPolicy::default()
        };
        assert!(policy.check("ñññ").is_err());
        assert!(policy.check("ññññ").is_ok());
    }

    #[test]
    fn hash_and_verify() -> anyhow::Result<()> {
        let hash = hash_password("P@ss1234")?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("P@ss1234", &hash));
        assert!(!verify_password("P@ss12345", &hash));
        assert!(!verify_password("P@ss1234", "not-a-phc-string"));
        assert!(!verify_or_burn("P@ss1234", None));
        Ok(())
    }

    #[test]
    fn usernames() {
        assert!(USERNAME_PATTERN.is_some());
        assert!(valid_username("ada.lovelace@example.com"));
        assert!(valid_username("ada+portier@example.com"));
        assert!(!valid_username(""));
        assert!(!valid_username("ada lovelace"));
        assert!(!valid_username(&"a".repeat(129)));
    }

    #[tokio::test]
    async fn register_hashes_and_reports_mfa() -> anyhow::Result<()> {
        let user_id = Uuid::from_u128(9);
        let store = policy_store(true).rows(REGISTER_USER, vec![json!({ "user_id": user_id })]);
        let mut conn = store.acquire().await?;

        let registration = register(
            conn.as_mut(),
            TenantId(Uuid::nil()),
            "ada",
            "P@ss1234",
            "P@ss1234",
        )
        .await?;
        assert_eq!(
            registration,
            Registration {
                user_id,
                mfa_required: true
            }
        );

        let calls = store.calls_to(REGISTER_USER);
        let stored = calls[0]
            .get_as::<String>("p_password_hash")
            .unwrap_or_default();
        assert!(verify_password("P@ss1234", &stored));
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_mismatch_and_policy() -> anyhow::Result<()> {
        let store = policy_store(false);
        let mut conn = store.acquire().await?;
        let tenant = TenantId(Uuid::nil());

        let mismatch = register(conn.as_mut(), tenant, "ada", "P@ss1234", "P@ss12345").await;
        assert!(
            matches!(mismatch, Err(GateError::BadRequest(message)) if message == "Passwords do not match")
        );

        let weak = register(conn.as_mut(), tenant, "ada", "password", "password").await;
        assert!(matches!(weak, Err(GateError::BadRequest(_))));
        assert!(store.calls_to(REGISTER_USER).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn register_conflict_is_tolerated() -> anyhow::Result<()> {
        let store = policy_store(false).on(REGISTER_USER, |_| {
            Err(MemoryStore::database_error(REGISTER_USER, UNIQUE_VIOLATION))
        });
        let mut conn = store.acquire().await?;
        let result = register(
            conn.as_mut(),
            TenantId(Uuid::nil()),
            "ada",
            "P@ss1234",
            "P@ss1234",
        )
        .await;
        assert!(matches!(result, Err(GateError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_checks_password() -> anyhow::Result<()> {
        let user_id = Uuid::from_u128(3);
        let hash = hash_password("P@ss1234")?;
        let store = MemoryStore::new().on(LOGIN_RECORD, move |params| {
            if params.get_as::<String>("p_username").as_deref() == Some("ada") {
                Ok(vec![json!({
                    "user_id": user_id,
                    "password_hash": hash,
                    "mfa_enrolled": false,
                })])
            } else {
                Ok(Vec::new())
            }
        });
        let mut conn = store.acquire().await?;
        let tenant = TenantId(Uuid::nil());

        let ok = authenticate(conn.as_mut(), tenant, "ada", "P@ss1234").await?;
        assert_eq!(ok.map(|record| record.user_id), Some(user_id));
        assert!(
            authenticate(conn.as_mut(), tenant, "ada", "wrong")
                .await?
                .is_none()
        );
        assert!(
            authenticate(conn.as_mut(), tenant, "bob", "P@ss1234")
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_policy_is_a_config_fault() -> anyhow::Result<()> {
        let store = MemoryStore::new().rows(TENANT_AUTH_POLICY, Vec::new());
        let mut conn = store.acquire().await?;
        let result = load_policy(conn.as_mut(), TenantId(Uuid::nil())).await;
        assert!(matches!(result, Err(GateError::Config(_))));
        Ok(())
    }
}
