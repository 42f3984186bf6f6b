use super::fail;
use crate::{
    api::state::AuthState,
    gate::{Gate, Navigation, RequestContext, redirect},
    session::{expired_session_cookie, session_token},
};
use axum::{extract::Extension, http::HeaderMap, response::IntoResponse};
use std::sync::Arc;
use tracing::{Level, debug};

#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 303, description = "Session ended, redirect to the login page")
    ),
    tag = "session"
)]
/// End the caller's session and clear its cookie.
pub async fn logout(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(gate): Extension<Arc<Gate>>,
) -> impl IntoResponse {
    let navigation = Navigation::from_headers(&headers);
    let login_path = gate.config().login_path();

    let Some(token) = session_token(&headers) else {
        return redirect(navigation, login_path, &[expired_session_cookie()]);
    };

    let result = {
        let mut conn = ctx.connection().await;
        auth.sessions().end(&mut **conn, &token).await
    };
    match result {
        Ok(cookie) => {
            if ctx.verbose(Level::DEBUG) {
                debug!(user_id = ?ctx.identity().map(|identity| identity.user_id), "logged out");
            }
            redirect(navigation, login_path, &[cookie])
        }
        Err(err) => fail(&ctx, err),
    }
}
