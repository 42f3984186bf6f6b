//! Passkey endpoints. The browser side calls `navigator.credentials.create`
//! or `.get` with the options returned by the `begin` endpoints and posts the
//! resulting credential, as JSON, to the matching `finish` endpoint.

use super::{fail, start_session};
use crate::{
    api::state::AuthState,
    error::{DenialReason, GateError},
    gate::RequestContext,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasskeyBeginRequest {
    pub username: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasskeyFinishRequest {
    pub username: String,
    /// The serialized `PublicKeyCredential` produced by the browser.
    #[schema(value_type = Object)]
    pub response: Value,
}

fn credential<T: serde::de::DeserializeOwned>(response: Value) -> Result<T, GateError> {
    serde_json::from_value(response)
        .map_err(|_| GateError::BadRequest("Malformed credential".to_string()))
}

#[utoipa::path(
    post,
    path = "/passkeys/register/begin",
    request_body = PasskeyBeginRequest,
    responses(
        (status = 200, description = "Creation options", body = Object),
        (status = 401, description = "Username not eligible")
    ),
    tag = "passkeys"
)]
pub async fn register_begin(
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyBeginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let mut conn = ctx.connection().await;
    match auth
        .passkeys()
        .register_begin(&mut **conn, ctx.tenant(), &request.username)
        .await
    {
        Ok(options) => Json(options).into_response(),
        Err(err) => fail(&ctx, err),
    }
}

#[utoipa::path(
    post,
    path = "/passkeys/register/finish",
    request_body = PasskeyFinishRequest,
    responses(
        (status = 303, description = "Account created and signed in"),
        (status = 400, description = "Malformed credential"),
        (status = 401, description = "Ceremony rejected")
    ),
    tag = "passkeys"
)]
pub async fn register_finish(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyFinishRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let response: RegisterPublicKeyCredential = match credential(request.response) {
        Ok(response) => response,
        Err(err) => return fail(&ctx, err),
    };

    let registered = {
        let mut conn = ctx.connection().await;
        auth.passkeys()
            .register_finish(&mut **conn, ctx.tenant(), &request.username, &response)
            .await
    };
    match registered {
        Ok(registered) => {
            start_session(
                &ctx,
                &auth,
                &headers,
                registered.user_id,
                registered.landing_path.as_deref(),
            )
            .await
        }
        Err(err) => fail(&ctx, err),
    }
}

#[utoipa::path(
    post,
    path = "/passkeys/login/begin",
    request_body = PasskeyBeginRequest,
    responses(
        (status = 200, description = "Request options", body = Object),
        (status = 401, description = "Ceremony rejected")
    ),
    tag = "passkeys"
)]
pub async fn login_begin(
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyBeginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let mut conn = ctx.connection().await;
    match auth
        .passkeys()
        .authenticate_begin(&mut **conn, ctx.tenant(), &request.username)
        .await
    {
        Ok(options) => Json(options).into_response(),
        Err(err) => fail(&ctx, err),
    }
}

#[utoipa::path(
    post,
    path = "/passkeys/login/finish",
    request_body = PasskeyFinishRequest,
    responses(
        (status = 303, description = "Signed in"),
        (status = 400, description = "Malformed credential"),
        (status = 401, description = "Ceremony rejected or possible cloned authenticator")
    ),
    tag = "passkeys"
)]
pub async fn login_finish(
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyFinishRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let response: PublicKeyCredential = match credential(request.response) {
        Ok(response) => response,
        Err(err) => return fail(&ctx, err),
    };

    let outcome = {
        let mut conn = ctx.connection().await;
        auth.passkeys()
            .authenticate_finish(&mut **conn, ctx.tenant(), &request.username, &response)
            .await
    };
    match outcome {
        Ok(outcome) if outcome.clone_warning => {
            warn!(tenant = %ctx.tenant(), user_id = %outcome.user_id, "passkey counter regressed");
            fail(&ctx, GateError::Denied(DenialReason::CloneWarning))
        }
        Ok(outcome) => {
            start_session(
                &ctx,
                &auth,
                &headers,
                outcome.user_id,
                outcome.landing_path.as_deref(),
            )
            .await
        }
        Err(err) => fail(&ctx, err),
    }
}
