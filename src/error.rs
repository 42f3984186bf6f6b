//! Request-time error taxonomy and its HTTP mapping.
//!
//! Boot-time faults never reach this type; they are `anyhow` errors that stop
//! the process before it listens.

use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// Why a caller was turned away. Only ever logged; the response is generic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    InvalidCredentials,
    InvalidSecondFactor,
    CeremonyRejected,
    CloneWarning,
    FederationRejected,
    Forbidden,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::InvalidCredentials => "invalid credentials",
            Self::InvalidSecondFactor => "invalid second factor",
            Self::CeremonyRejected => "webauthn ceremony rejected",
            Self::CloneWarning => "authenticator clone warning",
            Self::FederationRejected => "federated login rejected",
            Self::Forbidden => "forbidden",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("configuration fault: {0}")]
    Config(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("access denied: {0}")]
    Denied(DenialReason),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl GateError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Denied(DenialReason::Forbidden) => StatusCode::FORBIDDEN,
            Self::Denied(_) => StatusCode::UNAUTHORIZED,
            Self::Config(_) | Self::Store(_) | Self::Invariant(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Log the fault and render it for a caller who reads `language`.
    #[must_use]
    pub fn into_localized_response(self, language: &str) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(message) | Self::Conflict(message) => message.clone(),
            Self::Denied(reason) => {
                warn!(%reason, "request denied");
                access_denied(language).to_string()
            }
            Self::Invariant(detail) => {
                error!(%detail, "invariant violation");
                internal_error(language).to_string()
            }
            other => {
                error!("request failed: {other}");
                internal_error(language).to_string()
            }
        };
        (status, Json(ErrorBody { error: &message })).into_response()
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        self.into_localized_response(DEFAULT_LANGUAGE)
    }
}

pub const DEFAULT_LANGUAGE: &str = "en";

/// Generic denial text; it never says which check failed.
#[must_use]
pub fn access_denied(language: &str) -> &'static str {
    match primary_subtag(language).as_str() {
        "es" => "Acceso denegado",
        "de" => "Zugriff verweigert",
        "fr" => "Accès refusé",
        _ => "Access denied",
    }
}

#[must_use]
pub fn internal_error(language: &str) -> &'static str {
    match primary_subtag(language).as_str() {
        "es" => "Error interno",
        "de" => "Interner Fehler",
        "fr" => "Erreur interne",
        _ => "Internal error",
    }
}

fn primary_subtag(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
