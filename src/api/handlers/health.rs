use crate::{GIT_COMMIT_HASH, gate::Gate};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    store: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Store is reachable", body = [Health]),
        (status = 503, description = "Store is unreachable", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, gate: Extension<Arc<Gate>>) -> impl IntoResponse {
    let result = match gate.store().acquire().await {
        Ok(_conn) => Ok(()),
        Err(err) => {
            error!("Failed to acquire store connection: {err}");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = health.commit.get(..7).unwrap_or_default();

    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            debug!("X-App header: {:?}", value);
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to parse X-App header: {err}"),
    }

    match result {
        Ok(()) => (StatusCode::OK, headers, body),
        Err(status) => (status, headers, body),
    }
}
