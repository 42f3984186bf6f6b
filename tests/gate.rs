mod common;

use anyhow::Result;
use axum::{
    Extension, Router, middleware,
    http::{StatusCode, header},
    routing,
};
use common::{
    ANONYMOUS_ROLE, Caller, HOST, Sessions, app, get, json_body, location, routes, row,
    seed_session, session_store, set_cookies, tenant,
};
use portier::{
    gate::{Gate, GateConfig, RequestContext, guard},
    policy::{Chain, RoleName, RouteTable},
    session::SessionManager,
    tenant::TenantResolver,
};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

#[tokio::test]
async fn no_cookie_redirects_to_login() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let response = app.oneshot(get("/me", None)?).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login"));
    assert!(store.calls_to("portier.validate_session").is_empty());
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn partial_navigation_gets_hx_location() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let mut request = get("/me", None)?;
    request
        .headers_mut()
        .insert("hx-request", header::HeaderValue::from_static("true"));
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("hx-location")
            .and_then(|value| value.to_str().ok()),
        Some("/login")
    );
    Ok(())
}

#[tokio::test]
async fn stale_cookie_is_cleared() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let response = app.oneshot(get("/me", Some("expired-token"))?).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/"));
    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("session_token=;"));
    assert!(cookies[0].contains("Max-Age=0"));
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn valid_session_runs_as_the_callers_role() -> Result<()> {
    let sessions = Sessions::default();
    let caller = Caller::member();
    let store = session_store(&sessions, &caller);
    let token = seed_session(&sessions, caller.user_id);
    let app = app(&store, routes(&["member"])?)?;

    let response = app.oneshot(get("/me", Some(&token))?).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.assumed_roles(), vec!["member".to_string()]);
    let body = json_body(response).await?;
    assert_eq!(body["user_id"], caller.user_id.to_string());
    assert_eq!(body["role"], "member");
    assert_eq!(body["tenant_id"], common::tenant().0.to_string());

    let validated = store.calls_to("portier.validate_session");
    assert_eq!(validated.len(), 1);
    assert_eq!(validated[0].get_as::<String>("p_path").unwrap_or_default(), "/me");
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn missing_role_redirects_to_landing() -> Result<()> {
    let sessions = Sessions::default();
    let caller = Caller::member();
    let store = session_store(&sessions, &caller);
    let token = seed_session(&sessions, caller.user_id);
    let app = app(&store, routes(&["admin"])?)?;

    let response = app.oneshot(get("/me", Some(&token))?).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/home"));
    assert!(store.assumed_roles().is_empty());
    Ok(())
}

#[tokio::test]
async fn denied_landing_page_is_forbidden() -> Result<()> {
    let sessions = Sessions::default();
    let caller = Caller {
        landing_path: "/me",
        ..Caller::member()
    };
    let store = session_store(&sessions, &caller);
    let token = seed_session(&sessions, caller.user_id);
    let app = app(&store, routes(&["admin"])?)?;

    let response = app.oneshot(get("/me", Some(&token))?).await?;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn logout_ends_the_session() -> Result<()> {
    let sessions = Sessions::default();
    let caller = Caller::member();
    let store = session_store(&sessions, &caller);
    let token = seed_session(&sessions, caller.user_id);
    let app = app(&store, routes(&[])?)?;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/logout")
        .header(header::HOST, common::HOST)
        .header(header::COOKIE, format!("session_token={token}"))
        .body(axum::body::Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login"));
    assert!(set_cookies(&response)[0].contains("Max-Age=0"));
    assert!(sessions.lock().map(|s| s.is_empty()).unwrap_or(false));
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_origin_is_a_server_error() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let mut request = get("/me", None)?;
    request
        .headers_mut()
        .insert(header::HOST, header::HeaderValue::from_static("other.example.com"));
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn health_and_openapi_skip_the_gate() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let response = app.clone().oneshot(get("/health", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let response = app.oneshot(get("/openapi.json", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let document = json_body(response).await?;
    assert!(document["paths"]["/login"].is_object());

    assert!(store.assumed_roles().is_empty());
    Ok(())
}

async fn panicking_handler(Extension(ctx): Extension<RequestContext>) -> &'static str {
    let _conn = ctx.connection().await;
    panic!("handler failed while holding the connection");
}

#[tokio::test]
async fn panicking_handler_releases_its_connection() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let table = RouteTable::from_rows(vec![row("GET", "/boom", Chain::Unauthenticated, &[])?])?;
    let gate = Arc::new(Gate::new(
        TenantResolver::from_entries([(format!("https://{HOST}"), tenant())])?,
        table,
        Arc::new(store.clone()),
        SessionManager::new(60)?,
        GateConfig::new(RoleName::parse(ANONYMOUS_ROLE)?),
    ));
    let app = Router::new()
        .route("/boom", routing::get(panicking_handler))
        .route_layer(middleware::from_fn_with_state(gate, guard))
        .layer(CatchPanicLayer::new());

    let response = app.oneshot(get("/boom", None)?).await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.assumed_roles(), vec![ANONYMOUS_ROLE.to_string()]);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}
