//! HTTP handlers. Every handler except `health` runs behind the gate and
//! reads its tenant, identity and store connection from the
//! [`RequestContext`].

use super::state::AuthState;
use crate::{
    error::GateError,
    gate::{Navigation, RequestContext, redirect, redirect::safe_landing_path},
};
use axum::{http::HeaderMap, response::Response};
use uuid::Uuid;

pub mod health;
pub mod login;
pub mod me;
pub mod oidc;
pub mod passkeys;
pub mod register;
pub mod session;

/// Render an error in the caller's language.
pub(crate) fn fail(ctx: &RequestContext, err: impl Into<GateError>) -> Response {
    err.into().into_localized_response(ctx.language())
}

/// Start a session for `user_id` and send the browser to `landing`.
pub(crate) async fn start_session(
    ctx: &RequestContext,
    auth: &AuthState,
    headers: &HeaderMap,
    user_id: Uuid,
    landing: Option<&str>,
) -> Response {
    let sessions = auth.sessions();
    let expires_at = match sessions.expiry() {
        Ok(expires_at) => expires_at,
        Err(err) => return fail(ctx, err),
    };
    let mut conn = ctx.connection().await;
    match sessions.begin(&mut **conn, user_id, expires_at).await {
        Ok(session) => redirect(
            Navigation::from_headers(headers),
            &safe_landing_path(landing),
            &[session.header],
        ),
        Err(err) => fail(ctx, err),
    }
}
