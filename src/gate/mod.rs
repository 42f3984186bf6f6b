//! Identity and RBAC middleware.
//!
//! Every gated request passes through [`guard`], which:
//!
//! 1. finds the route rule for `(method, matched path)`,
//! 2. resolves the tenant from the request origin,
//! 3. checks out one store connection for the whole request,
//! 4. runs the authenticated or unauthenticated chain,
//! 5. elevates the connection to the caller's role (or the anonymous role),
//! 6. hands a [`RequestContext`] to the handler.
//!
//! Outcomes of the authenticated chain:
//!
//! | Session cookie | Outcome |
//! |---|---|
//! | missing | redirect to the login page |
//! | unknown, expired or foreign | clear the cookie, redirect to `/` |
//! | valid, roles permit the route | forward |
//! | valid, roles do not permit the route | redirect to the caller's landing page |

use crate::{
    error::{DEFAULT_LANGUAGE, DenialReason, GateError},
    policy::{Chain, RoleName, RouteRule, RouteTable},
    session::{SESSION_COOKIE_NAME, SessionManager, expired_session_cookie, session_token},
    store::Store,
    tenant::{TenantResolver, request_origin},
};
use anyhow::{Context, Result};
use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, Method, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};

pub mod context;
pub mod redirect;

pub use context::{CallerIdentity, RequestContext};
pub use redirect::{Navigation, redirect, redirect_external};

#[derive(Clone, Debug)]
pub struct GateConfig {
    default_scheme: String,
    login_path: String,
    anonymous_role: RoleName,
}

impl GateConfig {
    #[must_use]
    pub fn new(anonymous_role: RoleName) -> Self {
        Self {
            default_scheme: "https".to_string(),
            login_path: "/login".to_string(),
            anonymous_role,
        }
    }

    #[must_use]
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = redirect::safe_landing_path(Some(&path.into()));
        self
    }

    #[must_use]
    pub fn default_scheme(&self) -> &str {
        &self.default_scheme
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn anonymous_role(&self) -> &RoleName {
        &self.anonymous_role
    }
}

/// Immutable state shared by every request.
pub struct Gate {
    tenants: TenantResolver,
    routes: RouteTable,
    store: Arc<dyn Store>,
    sessions: SessionManager,
    config: GateConfig,
}

impl Gate {
    #[must_use]
    pub fn new(
        tenants: TenantResolver,
        routes: RouteTable,
        store: Arc<dyn Store>,
        sessions: SessionManager,
        config: GateConfig,
    ) -> Self {
        Self {
            tenants,
            routes,
            store,
            sessions,
            config,
        }
    }

    /// Load the tenant map and the route table from the store.
    ///
    /// # Errors
    /// Any failure here is a boot failure.
    pub async fn bootstrap(
        store: Arc<dyn Store>,
        sessions: SessionManager,
        config: GateConfig,
    ) -> Result<Self> {
        let mut conn = store
            .acquire()
            .await
            .context("Failed to acquire a store connection for boot")?;
        let tenants = TenantResolver::load(conn.as_mut())
            .await
            .context("Failed to load tenants")?;
        let routes = RouteTable::load(conn.as_mut())
            .await
            .context("Failed to load route table")?;
        drop(conn);

        Ok(Self::new(tenants, routes, store, sessions, config))
    }

    #[must_use]
    pub fn tenants(&self) -> &TenantResolver {
        &self.tenants
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

/// Gate middleware, mounted with `axum::middleware::from_fn_with_state`.
pub async fn guard(State(gate): State<Arc<Gate>>, mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let language = accept_language(request.headers());
    let navigation = Navigation::from_headers(request.headers());

    let Some(path) = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
    else {
        return GateError::Invariant("gated request without a matched path".to_string())
            .into_localized_response(&language);
    };

    let rule = match gate.routes.lookup(&method, &path) {
        Ok(rule) => rule.clone(),
        Err(err) => {
            error!("{err}");
            return GateError::Config(err.to_string()).into_localized_response(&language);
        }
    };

    let Some(origin) = request_origin(request.headers(), gate.config.default_scheme()) else {
        return GateError::BadRequest("Missing Host header".to_string())
            .into_localized_response(&language);
    };
    let tenant = gate.tenants.resolve(&origin);

    let mut conn = match gate.store.acquire().await {
        Ok(conn) => conn,
        Err(err) => return GateError::Store(err).into_localized_response(&language),
    };

    let token = session_token(request.headers());
    let mut clear_cookie = false;

    let identity = match rule.chain {
        Chain::Authenticated => {
            let Some(token) = token else {
                debug!(%method, %path, "no session cookie");
                return redirect(navigation, gate.config.login_path(), &[]);
            };
            let identity = match gate
                .sessions
                .validate(conn.as_mut(), &token, tenant, &method, &path)
                .await
            {
                Ok(Some(identity)) => identity,
                Ok(None) => {
                    debug!(%method, %path, "invalid session cookie");
                    return redirect(navigation, "/", &[expired_session_cookie()]);
                }
                Err(err) => return err.into_localized_response(&language),
            };
            if !rule.permits(&identity.roles) {
                return deny(navigation, &rule, &identity);
            }
            Some(identity)
        }
        Chain::Unauthenticated => match token {
            None => None,
            Some(token) => match gate
                .sessions
                .validate(conn.as_mut(), &token, tenant, &method, &path)
                .await
            {
                Ok(Some(identity)) => {
                    if landing_permits(&gate.routes, &identity) {
                        debug!(%method, %path, landing = %identity.landing_path, "already signed in");
                        return redirect(navigation, &identity.landing_path, &[]);
                    }
                    None
                }
                Ok(None) => {
                    clear_cookie = true;
                    None
                }
                Err(err) => return err.into_localized_response(&language),
            },
        },
    };

    let role = identity
        .as_ref()
        .map_or(gate.config.anonymous_role(), |identity| &identity.role);
    if let Err(err) = conn.assume_role(role).await {
        return GateError::Store(err).into_localized_response(&language);
    }

    let span = info_span!(
        "gate",
        tenant = %tenant,
        handler = rule.handler.as_str(),
        chain = %rule.chain,
        user_id = ?identity.as_ref().map(|identity| identity.user_id),
        role = %role,
        verbosity = %context::effective_verbosity(&rule, identity.as_ref()),
    );

    let ctx = RequestContext::new(tenant, rule, identity, language, conn);
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).instrument(span).await;
    if clear_cookie {
        clear_stale_cookie(&mut response);
    }
    response
}

/// Expire the caller's stale session cookie unless the handler already
/// issued a new one.
fn clear_stale_cookie(response: &mut Response) {
    let prefix = format!("{SESSION_COOKIE_NAME}=");
    let replaced = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .any(|value| value.as_bytes().starts_with(prefix.as_bytes()));
    if !replaced {
        response
            .headers_mut()
            .append(header::SET_COOKIE, expired_session_cookie());
    }
}

/// Send a caller whose roles do not permit the route back to their landing
/// page. If the landing page is the denied route itself, answer 403 instead.
fn deny(navigation: Navigation, rule: &RouteRule, identity: &CallerIdentity) -> Response {
    debug!(
        handler = %rule.handler,
        required = %rule.roles,
        held = %identity.roles,
        "roles do not permit route"
    );
    if landing_route(&identity.landing_path) == rule.path {
        return GateError::Denied(DenialReason::Forbidden)
            .into_localized_response(&identity.language);
    }
    redirect(navigation, &identity.landing_path, &[])
}

fn landing_permits(routes: &RouteTable, identity: &CallerIdentity) -> bool {
    routes
        .lookup(&Method::GET, landing_route(&identity.landing_path))
        .is_ok_and(|rule| rule.chain == Chain::Authenticated && rule.permits(&identity.roles))
}

fn landing_route(landing_path: &str) -> &str {
    landing_path
        .split(['?', '#'])
        .next()
        .unwrap_or(landing_path)
}

/// Primary language tag from `Accept-Language`.
fn accept_language(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|tag| tag.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .unwrap_or(DEFAULT_LANGUAGE)
        .to_string()
}
