#![allow(dead_code)]

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderValue, Method, Request, Response, header},
};
use portier::{
    api::{self, AuthState},
    gate::{Gate, GateConfig},
    oidc::{CookieSigner, HttpIdentityProvider, OidcDriver},
    policy::{Chain, RoleName, RouteTable, table::RouteRow},
    session::{SessionManager, cookie::hash_session_token},
    store::MemoryStore,
    tenant::{TenantId, TenantResolver},
    totp::TotpService,
    webauthn::{PasskeyPolicies, PasskeyService},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

pub const HOST: &str = "app.example.com";
pub const ANONYMOUS_ROLE: &str = "web_anon";

pub fn tenant() -> TenantId {
    TenantId(Uuid::from_u128(7))
}

pub fn row(method: &str, path: &str, chain: Chain, roles: &[&str]) -> Result<RouteRow> {
    Ok(serde_json::from_value(json!({
        "method": method,
        "path": path,
        "handler": format!("{method} {path}"),
        "chain": chain,
        "roles": roles,
    }))?)
}

/// A rule for every mounted route. `/me` needs one of `me_roles`.
pub fn routes(me_roles: &[&str]) -> Result<RouteTable> {
    let authenticated = [("GET", "/me"), ("POST", "/logout")];
    let open = [
        ("POST", "/register"),
        ("POST", "/register/totp"),
        ("POST", "/login"),
        ("POST", "/login/totp"),
        ("POST", "/passkeys/register/begin"),
        ("POST", "/passkeys/register/finish"),
        ("POST", "/passkeys/login/begin"),
        ("POST", "/passkeys/login/finish"),
        ("GET", "/oidc/{provider}"),
        ("GET", "/oidc/{provider}/callback"),
    ];

    let mut rows = Vec::new();
    for (method, path) in authenticated {
        let roles = if path == "/me" { me_roles } else { &[][..] };
        rows.push(row(method, path, Chain::Authenticated, roles)?);
    }
    for (method, path) in open {
        rows.push(row(method, path, Chain::Unauthenticated, &[])?);
    }
    let table = RouteTable::from_rows(rows)?;
    let mounted = api::mounted_routes();
    table.ensure_registered(
        mounted
            .iter()
            .map(|(method, path)| (method.clone(), path.as_str())),
    )?;
    Ok(table)
}

/// Identity the session store hands out for a known session.
#[derive(Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: &'static str,
    pub landing_path: &'static str,
}

impl Caller {
    pub fn member() -> Self {
        Self {
            user_id: Uuid::from_u128(42),
            role: "member",
            landing_path: "/home",
        }
    }
}

/// Sessions keyed by the hex token hash, as the store sees them.
pub type Sessions = Arc<Mutex<HashMap<String, Uuid>>>;

/// Store with session handlers. Sessions started through the API resolve
/// to `caller`.
pub fn session_store(sessions: &Sessions, caller: &Caller) -> MemoryStore {
    let begin = sessions.clone();
    let end = sessions.clone();
    let validate = sessions.clone();
    let caller = caller.clone();

    MemoryStore::new()
        .on("portier.begin_session", move |params| {
            let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
            let user = params.get_as::<Uuid>("p_user_id").unwrap_or_default();
            if let Ok(mut sessions) = begin.lock() {
                sessions.insert(hash, user);
            }
            Ok(Vec::new())
        })
        .on("portier.end_session", move |params| {
            let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
            if let Ok(mut sessions) = end.lock() {
                sessions.remove(&hash);
            }
            Ok(Vec::new())
        })
        .on("portier.validate_session", move |params| {
            let hash = params.get_as::<String>("p_token_hash").unwrap_or_default();
            let known = validate
                .lock()
                .ok()
                .and_then(|sessions| sessions.get(&hash).copied());
            Ok(known
                .map(|user_id| {
                    vec![json!({
                        "user_id": user_id,
                        "display_name": "Ada",
                        "language": "en",
                        "role": caller.role,
                        "roles": [caller.role],
                        "landing_path": caller.landing_path,
                    })]
                })
                .unwrap_or_default())
        })
}

/// Put a session for `user_id` straight into the store and return its token.
pub fn seed_session(sessions: &Sessions, user_id: Uuid) -> String {
    let token = format!("token-{user_id}");
    if let Ok(mut sessions) = sessions.lock() {
        sessions.insert(hex::encode(hash_session_token(&token)), user_id);
    }
    token
}

pub fn app(store: &MemoryStore, routes: RouteTable) -> Result<Router> {
    let tenants = TenantResolver::from_entries([(format!("https://{HOST}"), tenant())])?;
    let sessions = SessionManager::new(3600)?;
    let gate = Gate::new(
        tenants,
        routes,
        Arc::new(store.clone()),
        sessions.clone(),
        GateConfig::new(RoleName::parse(ANONYMOUS_ROLE)?),
    );
    let provider = Arc::new(HttpIdentityProvider::new(
        reqwest::Client::new(),
        Duration::from_secs(60),
    ));
    let auth = AuthState::new(
        sessions,
        TotpService::new("portier"),
        PasskeyService::new(PasskeyPolicies::default()),
        OidcDriver::new(
            provider,
            CookieSigner::new(SecretString::from(
                "0123456789abcdef0123456789abcdef".to_string(),
            )),
        ),
    );
    Ok(api::app(Arc::new(gate), Arc::new(auth)))
}

pub fn get(path: &str, token: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::HOST, HOST);
    if let Some(token) = token {
        builder = builder.header(header::COOKIE, format!("session_token={token}"));
    }
    Ok(builder.body(Body::empty())?)
}

pub fn post_json(path: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

pub async fn json_body(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn location(response: &Response<Body>) -> Option<&str> {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
}

pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value: &HeaderValue| value.to_str().ok())
        .map(ToString::to_string)
        .collect()
}
