//! Session lifecycle: begin, validate and end.
//!
//! A session is a random bearer token kept in the `session_token` cookie.
//! Only its SHA-256 hash reaches the store. Validation is a single store query
//! that checks the session, the tenant and the caller's standing for the
//! requested endpoint, and returns the identity the request runs as.

use crate::{
    error::GateError,
    gate::context::{CallerIdentity, IdentityRow},
    store::{self, Params, StoreConnection},
    tenant::TenantId,
};
use anyhow::{Context, anyhow};
use axum::http::{HeaderValue, Method};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error};
use uuid::Uuid;

pub mod cookie;

pub use cookie::{SESSION_COOKIE_NAME, expired_session_cookie, session_token};

const BEGIN_SESSION: &str = "portier.begin_session";
const END_SESSION: &str = "portier.end_session";
const VALIDATE_SESSION: &str = "portier.validate_session";

/// A freshly persisted session and the cookie announcing it.
#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub header: HeaderValue,
}

/// A positive lifetime of `seconds` whose deadline fits a timestamp.
///
/// # Errors
/// Returns an error for zero, negative or out-of-range values.
pub fn lifetime(seconds: i64) -> anyhow::Result<Duration> {
    let ttl = Duration::try_seconds(seconds)
        .filter(|ttl| *ttl > Duration::zero())
        .ok_or_else(|| anyhow!("lifetime of {seconds}s is out of range"))?;
    deadline(ttl)?;
    Ok(ttl)
}

/// `ttl` from now.
///
/// # Errors
/// Returns an error if the deadline overflows.
pub fn deadline(ttl: Duration) -> anyhow::Result<DateTime<Utc>> {
    Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow!("deadline {ttl} from now is out of range"))
}

#[derive(Clone, Debug)]
pub struct SessionManager {
    ttl: Duration,
}

impl SessionManager {
    /// # Errors
    /// Returns an error if `ttl_seconds` is not a usable lifetime.
    pub fn new(ttl_seconds: i64) -> anyhow::Result<Self> {
        let ttl = lifetime(ttl_seconds).context("Invalid session TTL")?;
        Ok(Self { ttl })
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for a session starting now.
    ///
    /// # Errors
    /// Returns an error if the expiry overflows.
    pub fn expiry(&self) -> Result<DateTime<Utc>, GateError> {
        Ok(deadline(self.ttl)?)
    }

    /// Persist a new session for `user_id` and build its cookie.
    ///
    /// The cookie is only produced once the store accepted the session.
    ///
    /// # Errors
    /// Returns an error if token generation or the store call fails.
    pub async fn begin(
        &self,
        conn: &mut dyn StoreConnection,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionCookie, GateError> {
        let token = cookie::generate_session_token()?;
        let params = Params::new()
            .bind("p_token_hash", cookie::hash_session_token(&token))
            .bind("p_user_id", user_id)
            .bind("p_expires_at", expires_at);
        store::call(conn, BEGIN_SESSION, &params, &[]).await?;

        let header = cookie::session_cookie(&token, expires_at, Utc::now())
            .context("failed to build session cookie")?;
        debug!(%user_id, %expires_at, "session started");

        Ok(SessionCookie {
            token,
            expires_at,
            header,
        })
    }

    /// Delete the session and return the cookie that clears it. Ending a
    /// session that does not exist is not an error.
    ///
    /// # Errors
    /// Returns an error if the store call fails.
    pub async fn end(
        &self,
        conn: &mut dyn StoreConnection,
        token: &str,
    ) -> Result<HeaderValue, GateError> {
        let params = Params::new().bind("p_token_hash", cookie::hash_session_token(token));
        store::call(conn, END_SESSION, &params, &[]).await?;
        Ok(expired_session_cookie())
    }

    /// Resolve a session token into the caller's identity for one endpoint.
    ///
    /// `Ok(None)` means the session is unknown, expired, or not valid for this
    /// tenant; the caller must be logged out.
    ///
    /// # Errors
    /// Returns [`GateError::Invariant`] when the store returns more than one
    /// identity, and store errors as they come.
    pub async fn validate(
        &self,
        conn: &mut dyn StoreConnection,
        token: &str,
        tenant: TenantId,
        method: &Method,
        path: &str,
    ) -> Result<Option<CallerIdentity>, GateError> {
        let params = Params::new()
            .bind("p_token_hash", cookie::hash_session_token(token))
            .bind("p_tenant_id", tenant.0)
            .bind("p_method", method.as_str())
            .bind("p_path", path);
        let mut rows: Vec<IdentityRow> = store::query(conn, VALIDATE_SESSION, &params).await?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop().map(CallerIdentity::from)),
            count => {
                error!(count, %tenant, "session resolved to more than one identity");
                Err(GateError::Invariant(format!(
                    "session resolved to {count} identities"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Param, Store};
    use serde_json::{Value, json};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    /// Store fixture that keeps sessions by token hash.
    fn session_store(user_id: Uuid) -> MemoryStore {
        let sessions: Arc<Mutex<HashMap<String, Uuid>>> = Arc::default();
        let begin = sessions.clone();
        let end = sessions.clone();
        let validate = sessions;

        MemoryStore::new()
            .on(BEGIN_SESSION, move |params| {
                let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
                let user = params.get_as::<Uuid>("p_user_id").unwrap_or_default();
                if let Ok(mut sessions) = begin.lock() {
                    sessions.insert(hash, user);
                }
                Ok(Vec::new())
            })
            .on(END_SESSION, move |params| {
                let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
                if let Ok(mut sessions) = end.lock() {
                    sessions.remove(&hash);
                }
                Ok(Vec::new())
            })
            .on(VALIDATE_SESSION, move |params| {
                let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
                let found = validate
                    .lock()
                    .ok()
                    .and_then(|sessions| sessions.get(&hash).copied());
                Ok(found
                    .filter(|user| *user == user_id)
                    .map(|user| {
                        vec![json!({
                            "user_id": user,
                            "display_name": "Ada",
                            "language": "es",
                            "role": "member",
                            "roles": ["member"],
                            "landing_path": "/home",
                        })]
                    })
                    .unwrap_or_default())
            })
    }

    #[test]
    fn out_of_range_ttls_fail_construction() -> anyhow::Result<()> {
        assert!(SessionManager::new(i64::MAX).is_err());
        assert!(SessionManager::new(0).is_err());
        assert!(lifetime(-5).is_err());
        assert!(lifetime(i64::MAX / 1000).is_err());

        let manager = SessionManager::new(86_400)?;
        assert_eq!(manager.ttl(), Duration::days(1));
        assert!(manager.expiry()? > Utc::now());
        Ok(())
    }

    #[tokio::test]
    async fn begin_validate_end() -> anyhow::Result<()> {
        let user_id = Uuid::from_u128(42);
        let store = session_store(user_id);
        let manager = SessionManager::new(3600)?;
        let tenant = TenantId(Uuid::from_u128(1));
        let mut conn = store.acquire().await?;

        let session = manager
            .begin(conn.as_mut(), user_id, manager.expiry()?)
            .await?;
        assert!(session.header.to_str()?.starts_with("session_token="));

        let identity = manager
            .validate(conn.as_mut(), &session.token, tenant, &Method::GET, "/me")
            .await?;
        assert_eq!(identity.map(|identity| identity.user_id), Some(user_id));

        let cleared = manager.end(conn.as_mut(), &session.token).await?;
        assert!(cleared.to_str()?.contains("Max-Age=0"));

        let identity = manager
            .validate(conn.as_mut(), &session.token, tenant, &Method::GET, "/me")
            .await?;
        assert!(identity.is_none());

        // Ending twice is fine.
        manager.end(conn.as_mut(), &session.token).await?;
        Ok(())
    }

    #[tokio::test]
    async fn only_the_hash_is_stored() -> anyhow::Result<()> {
        let user_id = Uuid::from_u128(42);
        let store = session_store(user_id);
        let manager = SessionManager::new(60)?;
        let mut conn = store.acquire().await?;

        let session = manager
            .begin(conn.as_mut(), user_id, manager.expiry()?)
            .await?;
        let calls = store.calls_to(BEGIN_SESSION);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].get("p_token_hash"),
            Some(&Param::Bytes(cookie::hash_session_token(&session.token)))
        );
        assert!(
            calls[0]
                .iter()
                .all(|(_, value)| value.to_json() != Value::String(session.token.clone()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn no_cookie_when_persistence_fails() -> anyhow::Result<()> {
        let store = MemoryStore::new().on(BEGIN_SESSION, |_| {
            Err(MemoryStore::database_error(BEGIN_SESSION, "40001"))
        });
        let manager = SessionManager::new(60)?;
        let mut conn = store.acquire().await?;
        let result = manager
            .begin(conn.as_mut(), Uuid::nil(), manager.expiry()?)
            .await;
        assert!(matches!(result, Err(GateError::Store(_))));
        Ok(())
    }

    #[tokio::test]
    async fn more_than_one_identity_is_an_invariant_violation() -> anyhow::Result<()> {
        let row = json!({"user_id": Uuid::nil(), "role": "member"});
        let store = MemoryStore::new().rows(VALIDATE_SESSION, vec![row.clone(), row]);
        let manager = SessionManager::new(60)?;
        let mut conn = store.acquire().await?;
        let result = manager
            .validate(
                conn.as_mut(),
                "token",
                TenantId(Uuid::nil()),
                &Method::GET,
                "/me",
            )
            .await;
        assert!(matches!(result, Err(GateError::Invariant(_))));
        Ok(())
    }
}
