//! Tenant resolution by request origin.
//!
//! Every deployment serves a fixed set of origins. The origin to tenant map is
//! loaded during boot and is immutable afterwards.

use crate::store::{self, Params, StoreConnection, StoreError};
use axum::http::{HeaderMap, header::HOST};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const TENANTS: &str = "portier.tenants";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Deserialize)]
struct TenantRow {
    tenant_id: Uuid,
    origin: String,
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("no tenants configured")]
    Empty,
    #[error("origin {0} is mapped to more than one tenant")]
    DuplicateOrigin(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default)]
pub struct TenantResolver {
    by_origin: HashMap<String, TenantId>,
}

impl TenantResolver {
    /// Load the origin map from the store.
    ///
    /// # Errors
    /// Fails on store errors, an empty result or a duplicate origin.
    pub async fn load(conn: &mut dyn StoreConnection) -> Result<Self, TenantError> {
        let rows: Vec<TenantRow> = store::query(conn, TENANTS, &Params::new()).await?;
        let resolver =
            Self::from_entries(rows.into_iter().map(|row| (row.origin, TenantId(row.tenant_id))))?;
        info!(tenants = resolver.len(), "tenant map loaded");
        Ok(resolver)
    }

    /// # Errors
    /// Fails on an empty input or a duplicate origin.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, TenantError>
    where
        I: IntoIterator<Item = (S, TenantId)>,
        S: AsRef<str>,
    {
        let mut by_origin = HashMap::new();
        for (origin, tenant) in entries {
            let origin = normalize_origin(origin.as_ref());
            if by_origin.insert(origin.clone(), tenant).is_some() {
                return Err(TenantError::DuplicateOrigin(origin));
            }
        }
        if by_origin.is_empty() {
            return Err(TenantError::Empty);
        }
        Ok(Self { by_origin })
    }

    /// Resolve the tenant serving `origin`.
    ///
    /// # Panics
    /// Panics when the origin is not configured. Requests for unknown origins
    /// are a deployment fault; the HTTP stack converts the panic into a 500.
    #[must_use]
    pub fn resolve(&self, origin: &str) -> TenantId {
        match self.get(origin) {
            Some(tenant) => tenant,
            None => panic!("no tenant configured for origin {origin}"),
        }
    }

    #[must_use]
    pub fn get(&self, origin: &str) -> Option<TenantId> {
        self.by_origin.get(&normalize_origin(origin)).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_origin.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_origin.is_empty()
    }
}

/// Lowercase and drop any trailing `/`.
#[must_use]
pub fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Origin of a request: scheme from `X-Forwarded-Proto` (or the default),
/// host from `X-Forwarded-Host` or `Host`.
#[must_use]
pub fn request_origin(headers: &HeaderMap, default_scheme: &str) -> Option<String> {
    let scheme = first_value(headers, "x-forwarded-proto").unwrap_or(default_scheme);
    let host = first_value(headers, "x-forwarded-host")
        .or_else(|| headers.get(HOST).and_then(|value| value.to_str().ok()))?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    Some(normalize_origin(&format!("{scheme}://{host}")))
}

fn first_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
