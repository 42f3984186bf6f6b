//! Password registration.
//!
//! Flow Overview:
//! 1) Check the username and the password against the tenant's policy.
//! 2) Create the user. A taken username is a conflict, never a crash.
//! 3) Tenants that enforce MFA get a TOTP secret to confirm first; everyone
//!    else gets a session right away and lands on `/`.

use super::{fail, start_session};
use crate::{
    api::state::AuthState,
    error::{DenialReason, GateError},
    gate::RequestContext,
    password,
    totp::Provisioning,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub confirmation: String,
}

/// Returned instead of a session when the tenant enforces MFA.
#[derive(Debug, Serialize, ToSchema)]
pub struct TotpEnrollmentResponse {
    pub mfa_required: bool,
    pub provisioning: Provisioning,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmTotpRequest {
    pub enrollment_id: Uuid,
    pub code: String,
}

#[utoipa::path(
    post,
    path = "/register",
    request_body = RegisterRequest,
    responses(
        (status = 303, description = "Registered and signed in"),
        (status = 200, description = "Registered, TOTP enrollment required", body = TotpEnrollmentResponse),
        (status = 400, description = "Invalid input or password policy violation"),
        (status = 409, description = "Username is not available")
    ),
    tag = "auth"
)]
/// Register with a username and password.
pub async fn register(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let registered = {
        let mut conn = ctx.connection().await;
        let registration = match password::register(
            &mut **conn,
            ctx.tenant(),
            &request.username,
            &request.password,
            &request.confirmation,
        )
        .await
        {
            Ok(registration) => registration,
            Err(err) => return fail(&ctx, err),
        };
        info!(tenant = %ctx.tenant(), user_id = %registration.user_id, "user registered");

        if registration.mfa_required {
            let account = request.username.trim();
            return match auth
                .totp()
                .enroll(&mut **conn, registration.user_id, account)
                .await
            {
                Ok(provisioning) => Json(TotpEnrollmentResponse {
                    mfa_required: true,
                    provisioning,
                })
                .into_response(),
                Err(err) => fail(&ctx, err),
            };
        }
        registration.user_id
    };

    start_session(&ctx, &auth, &headers, registered, Some("/")).await
}

#[utoipa::path(
    post,
    path = "/register/totp",
    request_body = ConfirmTotpRequest,
    responses(
        (status = 303, description = "TOTP confirmed and signed in"),
        (status = 401, description = "Invalid code")
    ),
    tag = "auth"
)]
/// Confirm a pending TOTP enrollment with its first code.
pub async fn register_totp(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<ConfirmTotpRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let confirmed = {
        let mut conn = ctx.connection().await;
        auth.totp()
            .confirm(&mut **conn, request.enrollment_id, &request.code)
            .await
    };
    match confirmed {
        Ok(Some(verified)) => {
            let landing = verified.landing_path.as_deref();
            start_session(&ctx, &auth, &headers, verified.user_id, landing).await
        }
        Ok(None) => fail(&ctx, GateError::Denied(DenialReason::InvalidSecondFactor)),
        Err(err) => fail(&ctx, err),
    }
}
