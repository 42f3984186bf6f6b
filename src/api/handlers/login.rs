//! Password login and its TOTP second step.
//!
//! Flow Overview:
//! 1) Verify the password. Unknown users cost the same as wrong passwords.
//! 2) Users with TOTP get a single-use nonce and must call `/login/totp`.
//!    Users of tenants that enforce MFA but who never enrolled get a secret
//!    to confirm through `/register/totp`.
//! 3) Everyone else gets a session and lands on their landing page. The
//!    landing page rides along with the nonce for TOTP users.

use super::{fail, register::TotpEnrollmentResponse, start_session};
use crate::{
    api::state::AuthState,
    error::{DenialReason, GateError},
    gate::RequestContext,
    password,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, debug};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SecondFactorResponse {
    pub mfa_required: bool,
    /// Redeem with `/login/totp` within five minutes.
    pub nonce: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginTotpRequest {
    pub nonce: String,
    pub code: String,
}

enum Next {
    Session(uuid::Uuid, Option<String>),
    Done(Response),
}

#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 303, description = "Signed in"),
        (status = 200, description = "Second factor required", body = SecondFactorResponse),
        (status = 401, description = "Invalid credentials")
    ),
    tag = "auth"
)]
/// Sign in with a username and password.
pub async fn login(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let next = {
        let mut conn = ctx.connection().await;
        match password_step(&ctx, &auth, &mut **conn, &request).await {
            Ok(next) => next,
            Err(err) => Next::Done(fail(&ctx, err)),
        }
    };

    match next {
        Next::Session(user_id, landing) => {
            start_session(&ctx, &auth, &headers, user_id, landing.as_deref()).await
        }
        Next::Done(response) => response,
    }
}

async fn password_step(
    ctx: &RequestContext,
    auth: &AuthState,
    conn: &mut dyn crate::store::StoreConnection,
    request: &LoginRequest,
) -> Result<Next, GateError> {
    let record = password::authenticate(conn, ctx.tenant(), &request.username, &request.password)
        .await?
        .ok_or(GateError::Denied(DenialReason::InvalidCredentials))?;

    if record.mfa_enrolled {
        let nonce = auth
            .totp()
            .begin_nonce(conn, record.user_id, record.landing_path.as_deref())
            .await?;
        if ctx.verbose(Level::DEBUG) {
            debug!(user_id = %record.user_id, "second factor required");
        }
        return Ok(Next::Done(
            Json(SecondFactorResponse {
                mfa_required: true,
                nonce,
            })
            .into_response(),
        ));
    }

    if password::load_policy(conn, ctx.tenant()).await?.mfa_required {
        let provisioning = auth
            .totp()
            .enroll(conn, record.user_id, request.username.trim())
            .await?;
        return Ok(Next::Done(
            Json(TotpEnrollmentResponse {
                mfa_required: true,
                provisioning,
            })
            .into_response(),
        ));
    }

    Ok(Next::Session(record.user_id, record.landing_path))
}

#[utoipa::path(
    post,
    path = "/login/totp",
    request_body = LoginTotpRequest,
    responses(
        (status = 303, description = "Signed in"),
        (status = 401, description = "Invalid or expired nonce or code")
    ),
    tag = "auth"
)]
/// Finish a password login with a TOTP code.
pub async fn login_totp(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<LoginTotpRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let redeemed = {
        let mut conn = ctx.connection().await;
        auth.totp()
            .redeem_nonce(&mut **conn, &request.nonce, &request.code)
            .await
    };
    match redeemed {
        Ok(Some(verified)) => {
            let landing = verified.landing_path.as_deref();
            start_session(&ctx, &auth, &headers, verified.user_id, landing).await
        }
        Ok(None) => fail(&ctx, GateError::Denied(DenialReason::InvalidSecondFactor)),
        Err(err) => fail(&ctx, err),
    }
}
