use crate::{
    policy::{RoleName, RoleSet, RouteRule},
    store::StoreConnection,
    tenant::TenantId,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::Level;
use uuid::Uuid;

/// Who is calling, rebuilt from the store on every request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub display_name: String,
    pub language: String,
    /// Role the store connection is elevated to.
    pub role: RoleName,
    pub roles: RoleSet,
    /// Minimum log level requested for this user's requests.
    pub log_level: Level,
    pub landing_path: String,
}

/// Row shape returned by `portier.validate_session(...)`.
#[derive(Debug, Deserialize)]
pub(crate) struct IdentityRow {
    pub user_id: Uuid,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub role: RoleName,
    #[serde(default)]
    pub roles: Option<RoleSet>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub landing_path: Option<String>,
}

impl From<IdentityRow> for CallerIdentity {
    fn from(row: IdentityRow) -> Self {
        let log_level = row
            .log_level
            .as_deref()
            .and_then(|level| level.trim().parse::<Level>().ok())
            .unwrap_or(Level::INFO);
        Self {
            user_id: row.user_id,
            display_name: row.display_name.unwrap_or_default(),
            language: row
                .language
                .unwrap_or_else(|| crate::error::DEFAULT_LANGUAGE.to_string()),
            role: row.role,
            roles: row.roles.unwrap_or_default(),
            log_level,
            landing_path: super::redirect::safe_landing_path(row.landing_path.as_deref()),
        }
    }
}

/// Everything a handler needs about the current request, inserted by
/// [`super::guard`] as a request extension.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    tenant: TenantId,
    rule: RouteRule,
    identity: Option<CallerIdentity>,
    language: String,
    conn: Mutex<Box<dyn StoreConnection>>,
}

impl RequestContext {
    pub(crate) fn new(
        tenant: TenantId,
        rule: RouteRule,
        identity: Option<CallerIdentity>,
        language: String,
        conn: Box<dyn StoreConnection>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                tenant,
                rule,
                identity,
                language,
                conn: Mutex::new(conn),
            }),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> TenantId {
        self.inner.tenant
    }

    #[must_use]
    pub fn rule(&self) -> &RouteRule {
        &self.inner.rule
    }

    #[must_use]
    pub fn identity(&self) -> Option<&CallerIdentity> {
        self.inner.identity.as_ref()
    }

    /// Caller's language: the identity's, else the request's `Accept-Language`.
    #[must_use]
    pub fn language(&self) -> &str {
        self.inner
            .identity
            .as_ref()
            .map_or(self.inner.language.as_str(), |identity| {
                identity.language.as_str()
            })
    }

    /// The more verbose of the route's and the caller's log levels.
    #[must_use]
    pub fn verbosity(&self) -> Level {
        effective_verbosity(&self.inner.rule, self.inner.identity.as_ref())
    }

    #[must_use]
    pub fn verbose(&self, level: Level) -> bool {
        level <= self.verbosity()
    }

    /// The request's store connection, already elevated to the caller's role.
    pub async fn connection(&self) -> MutexGuard<'_, Box<dyn StoreConnection>> {
        self.inner.conn.lock().await
    }
}

pub(crate) fn effective_verbosity(rule: &RouteRule, identity: Option<&CallerIdentity>) -> Level {
    identity.map_or(rule.log_level, |identity| {
        std::cmp::max(rule.log_level, identity.log_level)
    })
}
