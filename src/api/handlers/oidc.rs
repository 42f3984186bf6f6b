use super::fail;
use crate::{
    api::state::AuthState,
    gate::{Navigation, RequestContext, redirect, redirect_external, redirect::safe_landing_path},
    oidc::{CallbackQuery, NONCE_COOKIE, STATE_COOKIE, cookies::expired_cookie},
};
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, header},
    response::Response,
};
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/oidc/{provider}",
    params(("provider" = String, Path, description = "Provider name configured for the tenant")),
    responses(
        (status = 303, description = "Redirect to the provider's authorization endpoint"),
        (status = 400, description = "Unknown identity provider")
    ),
    tag = "oidc"
)]
/// Send the browser to the identity provider.
pub async fn authorize(
    headers: HeaderMap,
    Path(provider): Path<String>,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
) -> Response {
    let authorization = {
        let mut conn = ctx.connection().await;
        auth.oidc().call(&mut **conn, ctx.tenant(), &provider).await
    };
    match authorization {
        Ok(authorization) => redirect_external(
            Navigation::from_headers(&headers),
            &authorization.redirect,
            &authorization.cookies,
        ),
        Err(err) => fail(&ctx, err),
    }
}

#[utoipa::path(
    get,
    path = "/oidc/{provider}/callback",
    params(
        ("provider" = String, Path, description = "Provider name configured for the tenant"),
        CallbackQuery
    ),
    responses(
        (status = 303, description = "Signed in, redirect to the landing page"),
        (status = 401, description = "Federated login rejected")
    ),
    tag = "oidc"
)]
/// Finish a federated login.
pub async fn callback(
    headers: HeaderMap,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    Extension(ctx): Extension<RequestContext>,
    Extension(auth): Extension<Arc<AuthState>>,
) -> Response {
    let login = {
        let mut conn = ctx.connection().await;
        auth.oidc()
            .callback(
                &mut **conn,
                auth.sessions(),
                ctx.tenant(),
                &provider,
                &query,
                &headers,
            )
            .await
    };
    match login {
        Ok(login) => redirect(
            Navigation::from_headers(&headers),
            &safe_landing_path(login.landing_path.as_deref()),
            &login.cookies,
        ),
        Err(err) => {
            let mut response = fail(&ctx, err);
            expire_exchange_cookies(&mut response);
            response
        }
    }
}

/// A failed callback ends the exchange; its cookies go with it.
fn expire_exchange_cookies(response: &mut Response) {
    for name in [STATE_COOKIE, NONCE_COOKIE] {
        if let Ok(cookie) = expired_cookie(name) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
}
