mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{Caller, Sessions, app, json_body, location, post_json, routes, session_store, set_cookies};
use portier::{password::hash_password, store::MemoryStore, totp::code_at};
use serde_json::json;
use std::{
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};
use tower::ServiceExt;
use uuid::Uuid;

fn now() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

fn with_policy(store: MemoryStore, mfa_required: bool) -> MemoryStore {
    store.rows(
        "portier.tenant_auth_policy",
        vec![json!({ "min_length": 8, "mfa_required": mfa_required })],
    )
}

/// Keeps the secret handed to `totp_enroll` so tests can answer with codes.
fn with_totp(store: MemoryStore, user_id: Uuid) -> (MemoryStore, Arc<Mutex<String>>) {
    let secret: Arc<Mutex<String>> = Arc::default();
    let enrolled = secret.clone();
    let pending = secret.clone();
    let store = store
        .on("portier.totp_enroll", move |params| {
            if let Ok(mut secret) = enrolled.lock() {
                *secret = params.get_as::<String>("p_secret").unwrap_or_default();
            }
            Ok(Vec::new())
        })
        .on("portier.totp_pending", move |_| {
            let secret = pending.lock().map(|s| s.clone()).unwrap_or_default();
            Ok(vec![json!({
                "user_id": user_id,
                "secret": secret,
                "landing_path": "/home",
            })])
        })
        .rows("portier.totp_confirm", Vec::new());
    (store, secret)
}

#[tokio::test]
async fn registration_without_mfa_starts_a_session() -> Result<()> {
    let sessions = Sessions::default();
    let user_id = Uuid::from_u128(42);
    let store = with_policy(session_store(&sessions, &Caller::member()), false)
        .rows("portier.register_user", vec![json!({ "user_id": user_id })]);
    let app = app(&store, routes(&[])?)?;

    let response = app
        .oneshot(post_json(
            "/register",
            &json!({"username": "ada", "password": "P@ss1234", "confirmation": "P@ss1234"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/"));
    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("session_token="));
    assert!(cookies[0].contains("HttpOnly"));

    let begun = store.calls_to("portier.begin_session");
    assert_eq!(begun.len(), 1);
    assert_eq!(begun[0].get_as::<Uuid>("p_user_id"), Some(user_id));

    let registered = store.calls_to("portier.register_user");
    let hash = registered[0]
        .get_as::<String>("p_password_hash")
        .unwrap_or_default();
    assert!(hash.starts_with("$argon2id$"));
    assert_eq!(store.assumed_roles(), vec![common::ANONYMOUS_ROLE.to_string()]);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn registration_rejects_policy_violations() -> Result<()> {
    let sessions = Sessions::default();
    let store = with_policy(session_store(&sessions, &Caller::member()), false);
    let app = app(&store, routes(&[])?)?;

    let response = app
        .oneshot(post_json(
            "/register",
            &json!({"username": "ada", "password": "short", "confirmation": "other"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.calls_to("portier.register_user").is_empty());
    assert!(store.calls_to("portier.begin_session").is_empty());
    Ok(())
}

#[tokio::test]
async fn taken_username_is_a_conflict() -> Result<()> {
    let sessions = Sessions::default();
    let store = with_policy(session_store(&sessions, &Caller::member()), false).on(
        "portier.register_user",
        |_| Err(MemoryStore::database_error("portier.register_user", "23505")),
    );
    let app = app(&store, routes(&[])?)?;

    let response = app
        .oneshot(post_json(
            "/register",
            &json!({"username": "ada", "password": "P@ss1234", "confirmation": "P@ss1234"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn registration_with_mfa_requires_totp_confirmation() -> Result<()> {
    let sessions = Sessions::default();
    let user_id = Uuid::from_u128(42);
    let store = with_policy(session_store(&sessions, &Caller::member()), true)
        .rows("portier.register_user", vec![json!({ "user_id": user_id })]);
    let (store, secret) = with_totp(store, user_id);
    let app = app(&store, routes(&[])?)?;

    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            &json!({"username": "ada", "password": "P@ss1234", "confirmation": "P@ss1234"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookies(&response).is_empty());
    let body = json_body(response).await?;
    assert_eq!(body["mfa_required"], true);
    let enrollment_id = body["provisioning"]["enrollment_id"].clone();
    assert!(
        body["provisioning"]["qr_code_url"]
            .as_str()
            .is_some_and(|url| url.starts_with("data:image/png;base64,"))
    );
    assert!(store.calls_to("portier.begin_session").is_empty());

    let response = app
        .clone()
        .oneshot(post_json(
            "/register/totp",
            &json!({"enrollment_id": enrollment_id, "code": "000000x"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let secret = secret.lock().map(|s| s.clone()).unwrap_or_default();
    let code = code_at(&secret, now()?)?;
    let response = app
        .oneshot(post_json(
            "/register/totp",
            &json!({"enrollment_id": enrollment_id, "code": code}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/home"));
    assert_eq!(store.calls_to("portier.totp_confirm").len(), 1);
    assert_eq!(store.calls_to("portier.begin_session").len(), 1);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn login_lands_on_the_users_page() -> Result<()> {
    let sessions = Sessions::default();
    let user_id = Uuid::from_u128(42);
    let store = with_policy(session_store(&sessions, &Caller::member()), false).rows(
        "portier.login_record",
        vec![json!({
            "user_id": user_id,
            "password_hash": hash_password("P@ss1234")?,
            "mfa_enrolled": false,
            "landing_path": "/home",
        })],
    );
    let app = app(&store, routes(&[])?)?;

    let response = app
        .clone()
        .oneshot(post_json(
            "/login",
            &json!({"username": "ada", "password": "wrong-password"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());

    let response = app
        .oneshot(post_json(
            "/login",
            &json!({"username": "ada", "password": "P@ss1234"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/home"));
    assert!(set_cookies(&response)[0].starts_with("session_token="));
    Ok(())
}

#[tokio::test]
async fn login_with_totp_redeems_the_nonce_once() -> Result<()> {
    let sessions = Sessions::default();
    let user_id = Uuid::from_u128(42);
    let secret = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";
    let nonces: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
    let begun = nonces.clone();
    let taken = nonces.clone();

    let store = with_policy(session_store(&sessions, &Caller::member()), true)
        .rows(
            "portier.login_record",
            vec![json!({
                "user_id": user_id,
                "password_hash": hash_password("P@ss1234")?,
                "mfa_enrolled": true,
                "landing_path": "/home",
            })],
        )
        .on("portier.mfa_nonce_begin", move |params| {
            if let Ok(mut nonces) = begun.lock() {
                nonces.push((
                    params.get_as::<String>("p_nonce_hash").unwrap_or_default(),
                    params.get_as::<String>("p_landing_path"),
                ));
            }
            Ok(Vec::new())
        })
        .on("portier.mfa_nonce_take", move |params| {
            let hash = params.get_as::<String>("p_nonce_hash").unwrap_or_default();
            let mut nonces = taken.lock().map_err(|_| {
                MemoryStore::database_error("portier.mfa_nonce_take", "XX000")
            })?;
            Ok(match nonces.iter().position(|(stored, _)| *stored == hash) {
                Some(index) => {
                    let (_, landing_path) = nonces.remove(index);
                    vec![json!({
                        "user_id": user_id,
                        "landing_path": landing_path,
                        "expires_at": chrono::Utc::now() + chrono::Duration::minutes(5),
                    })]
                }
                None => Vec::new(),
            })
        })
        .rows("portier.totp_secret", vec![json!({ "secret": secret })]);
    let app = app(&store, routes(&[])?)?;

    let response = app
        .clone()
        .oneshot(post_json(
            "/login",
            &json!({"username": "ada", "password": "P@ss1234"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookies(&response).is_empty());
    let body = json_body(response).await?;
    let nonce = body["nonce"].as_str().unwrap_or_default().to_string();
    assert!(!nonce.is_empty());

    let code = code_at(secret, now()?)?;
    let response = app
        .clone()
        .oneshot(post_json("/login/totp", &json!({"nonce": nonce, "code": code}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/home"));
    assert!(set_cookies(&response)[0].starts_with("session_token="));

    let response = app
        .oneshot(post_json("/login/totp", &json!({"nonce": nonce, "code": code}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(store.calls_to("portier.begin_session").len(), 1);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn signed_in_callers_skip_the_login_page() -> Result<()> {
    let sessions = Sessions::default();
    let caller = Caller {
        landing_path: "/me",
        ..Caller::member()
    };
    let store = with_policy(session_store(&sessions, &caller), false);
    let token = common::seed_session(&sessions, caller.user_id);
    let app = app(&store, routes(&["member"])?)?;

    let mut request = post_json("/login", &json!({"username": "ada", "password": "x"}))?;
    request.headers_mut().insert(
        axum::http::header::COOKIE,
        axum::http::HeaderValue::from_str(&format!("session_token={token}"))?,
    );
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/me"));
    assert!(store.calls_to("portier.login_record").is_empty());
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn login_over_a_stale_cookie_keeps_the_new_session() -> Result<()> {
    let sessions = Sessions::default();
    let user_id = Uuid::from_u128(42);
    let store = with_policy(session_store(&sessions, &Caller::member()), false).rows(
        "portier.login_record",
        vec![json!({
            "user_id": user_id,
            "password_hash": hash_password("P@ss1234")?,
            "mfa_enrolled": false,
            "landing_path": "/home",
        })],
    );
    let app = app(&store, routes(&[])?)?;

    let mut request = post_json("/login", &json!({"username": "ada", "password": "P@ss1234"}))?;
    request.headers_mut().insert(
        axum::http::header::COOKIE,
        axum::http::HeaderValue::from_static("session_token=expired"),
    );
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/home"));
    let cookies = set_cookies(&response);
    let session_cookies: Vec<&String> = cookies
        .iter()
        .filter(|cookie| cookie.starts_with("session_token="))
        .collect();
    assert_eq!(session_cookies.len(), 1);
    assert!(!session_cookies[0].starts_with("session_token=;"));
    assert!(!session_cookies[0].contains("Max-Age=0"));
    assert_eq!(store.calls_to("portier.begin_session").len(), 1);
    assert_eq!(store.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn stale_cookie_on_a_failed_login_is_cleared() -> Result<()> {
    let sessions = Sessions::default();
    let store = with_policy(session_store(&sessions, &Caller::member()), false)
        .rows("portier.login_record", Vec::new());
    let app = app(&store, routes(&[])?)?;

    let mut request = post_json("/login", &json!({"username": "ada", "password": "P@ss1234"}))?;
    request.headers_mut().insert(
        axum::http::header::COOKIE,
        axum::http::HeaderValue::from_static("session_token=expired"),
    );
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("session_token=;"));
    assert!(cookies[0].contains("Max-Age=0"));
    Ok(())
}

#[tokio::test]
async fn passkeys_need_a_tenant_policy() -> Result<()> {
    let sessions = Sessions::default();
    let store = session_store(&sessions, &Caller::member());
    let app = app(&store, routes(&[])?)?;

    let response = app
        .oneshot(post_json("/passkeys/login/begin", &json!({"username": "ada"}))?)
        .await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(set_cookies(&response).is_empty());
    Ok(())
}
