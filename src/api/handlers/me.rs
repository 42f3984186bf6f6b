use super::fail;
use crate::{error::GateError, gate::RequestContext};
use axum::{extract::Extension, response::IntoResponse, response::Json};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub display_name: String,
    pub language: String,
    pub role: String,
    pub roles: Vec<String>,
    pub landing_path: String,
    pub tenant_id: Uuid,
}

#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Caller identity", body = MeResponse),
        (status = 303, description = "Not signed in")
    ),
    tag = "session"
)]
/// Who the gate resolved the caller to.
pub async fn me(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    let Some(identity) = ctx.identity() else {
        return fail(
            &ctx,
            GateError::Config(format!(
                "{} {} must run on the authenticated chain",
                ctx.rule().method,
                ctx.rule().path
            )),
        );
    };

    Json(MeResponse {
        user_id: identity.user_id,
        display_name: identity.display_name.clone(),
        language: identity.language.clone(),
        role: identity.role.to_string(),
        roles: identity.roles.iter().map(ToString::to_string).collect(),
        landing_path: identity.landing_path.clone(),
        tenant_id: ctx.tenant().0,
    })
    .into_response()
}
