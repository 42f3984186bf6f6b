//! HTTP surface: router assembly and the server loop.
//!
//! Gated routes carry the gate as a route layer so the matched path template
//! is known when the route table is consulted. `/health` and `/openapi.json`
//! are served without it.

use crate::{
    APP_USER_AGENT,
    cli::telemetry::shutdown_tracer,
    gate::{Gate, GateConfig, guard},
    oidc::{CookieSigner, HttpIdentityProvider, OidcDriver},
    session::{self, SessionManager},
    store::{PgStore, Store},
    totp::TotpService,
    webauthn::{PasskeyPolicies, PasskeyService},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware,
    response::Json,
    routing::get,
};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub mod handlers;
mod openapi;
pub mod state;

pub use openapi::{mounted_routes, openapi};
pub use state::AuthState;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Everything the server needs besides the store contents.
#[derive(Debug)]
pub struct Settings {
    pub port: u16,
    pub dsn: SecretString,
    pub max_connections: u32,
    pub gate: GateConfig,
    pub session_ttl_seconds: i64,
    pub cookie_secret: SecretString,
    pub totp_issuer: String,
    pub passkey_challenge_ttl_seconds: i64,
    pub oidc_discovery_ttl_seconds: u64,
}

/// Assemble the application router.
#[must_use]
pub fn app(gate: Arc<Gate>, auth: Arc<AuthState>) -> Router {
    let (gated, _) = openapi::gated_router().split_for_parts();
    let (public, _) = openapi::public_router().split_for_parts();
    let document = openapi();

    gated
        .route_layer(middleware::from_fn_with_state(gate.clone(), guard))
        .merge(public)
        .route(
            "/openapi.json",
            get(move || {
                let document = document.clone();
                async move { Json(document) }
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    REQUEST_ID,
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(REQUEST_ID))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CatchPanicLayer::new())
                .layer(Extension(auth))
                .layer(Extension(gate)),
        )
}

/// Boot and serve until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if the store is unreachable, the boot data is invalid,
/// a mounted route has no rule or the listener cannot bind.
pub async fn new(settings: Settings) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        PgStore::connect(settings.dsn.expose_secret(), settings.max_connections).await?,
    );

    let sessions = SessionManager::new(settings.session_ttl_seconds)?;
    let gate = Gate::bootstrap(store.clone(), sessions.clone(), settings.gate).await?;

    let mounted = mounted_routes();
    gate.routes()
        .ensure_registered(
            mounted
                .iter()
                .map(|(method, path)| (method.clone(), path.as_str())),
        )
        .context("Route table does not cover every mounted endpoint")?;

    let passkeys = {
        let mut conn = store
            .acquire()
            .await
            .context("Failed to acquire a store connection for boot")?;
        let default_ttl = session::lifetime(settings.passkey_challenge_ttl_seconds)
            .context("Invalid passkey challenge TTL")?;
        PasskeyPolicies::load(conn.as_mut(), default_ttl).await?
    };

    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;
    let provider = Arc::new(HttpIdentityProvider::new(
        client,
        Duration::from_secs(settings.oidc_discovery_ttl_seconds),
    ));

    let auth = Arc::new(AuthState::new(
        sessions,
        TotpService::new(settings.totp_issuer),
        PasskeyService::new(passkeys),
        OidcDriver::new(provider, CookieSigner::new(settings.cookie_secret)),
    ));

    info!(
        tenants = gate.tenants().len(),
        routes = gate.routes().len(),
        "gate ready"
    );

    let app = app(Arc::new(gate), auth);
    let listener = TcpListener::bind(format!("::0:{}", settings.port)).await?;

    info!("Listening on [::]:{}", settings.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tracer();
    info!("Gracefully shutdown");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl_c signal received"),
        () = terminate => info!("terminate signal received"),
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
