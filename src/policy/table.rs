//! Route authorization table.
//!
//! One rule per `(method, path)` where `path` is the router's matched path
//! pattern (for example `/oidc/{provider}`). The table is loaded once during
//! boot and never mutated afterwards.

use super::roles::RoleSet;
use crate::store::{self, Params, StoreConnection, StoreError};
use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;
use tracing::{Level, info};

const ROUTE_RULES: &str = "portier.route_rules";

/// Middleware chain a route runs through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Authenticated,
    Unauthenticated,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => f.write_str("authenticated"),
            Self::Unauthenticated => f.write_str("unauthenticated"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub method: Method,
    pub path: String,
    pub handler: String,
    pub chain: Chain,
    pub roles: RoleSet,
    pub log_level: Level,
}

impl RouteRule {
    /// An empty role set admits any authenticated identity.
    #[must_use]
    pub fn permits(&self, roles: &RoleSet) -> bool {
        self.roles.is_empty() || self.roles.intersects(roles)
    }
}

/// Row shape returned by `portier.route_rules()`.
#[derive(Clone, Debug, Deserialize)]
pub struct RouteRow {
    pub method: String,
    pub path: String,
    pub handler: String,
    pub chain: Chain,
    #[serde(default)]
    pub roles: Option<RoleSet>,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Error)]
pub enum RouteTableError {
    #[error("route table is empty")]
    Empty,
    #[error("invalid method {method:?} for route {path}")]
    InvalidMethod { method: String, path: String },
    #[error("invalid log level {level:?} for route {method} {path}")]
    InvalidLogLevel {
        method: String,
        path: String,
        level: String,
    },
    #[error("duplicate route rule for {method} {path}")]
    Duplicate { method: Method, path: String },
    #[error("route table indexed {indexed} of {loaded} rows")]
    CountMismatch { loaded: usize, indexed: usize },
    #[error("routes mounted without a rule: {}", .0.join(", "))]
    Unregistered(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no route rule for {method} {path}")]
pub struct RouteNotFound {
    pub method: Method,
    pub path: String,
}

#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    rules: HashMap<(Method, String), RouteRule>,
}

impl RouteTable {
    /// Load every rule from the store.
    ///
    /// # Errors
    /// Fails on store errors, an empty result, malformed rows or duplicate keys.
    pub async fn load(conn: &mut dyn StoreConnection) -> Result<Self, RouteTableError> {
        let rows: Vec<RouteRow> = store::query(conn, ROUTE_RULES, &Params::new()).await?;
        let table = Self::from_rows(rows)?;
        info!(rules = table.len(), "route table loaded");
        Ok(table)
    }

    /// Index rows by `(method, path)`.
    ///
    /// # Errors
    /// Fails on an empty input, malformed rows or duplicate keys.
    pub fn from_rows(rows: Vec<RouteRow>) -> Result<Self, RouteTableError> {
        if rows.is_empty() {
            return Err(RouteTableError::Empty);
        }
        let loaded = rows.len();
        let mut rules = HashMap::with_capacity(loaded);

        for row in rows {
            let rule = parse_row(row)?;
            let key = (rule.method.clone(), rule.path.clone());
            if rules.contains_key(&key) {
                return Err(RouteTableError::Duplicate {
                    method: key.0,
                    path: key.1,
                });
            }
            rules.insert(key, rule);
        }

        if rules.len() != loaded {
            return Err(RouteTableError::CountMismatch {
                loaded,
                indexed: rules.len(),
            });
        }

        Ok(Self { rules })
    }

    /// # Errors
    /// Returns [`RouteNotFound`] when no rule exists for the key.
    pub fn lookup(&self, method: &Method, path: &str) -> Result<&RouteRule, RouteNotFound> {
        self.rules
            .get(&(method.clone(), path.to_string()))
            .ok_or_else(|| RouteNotFound {
                method: method.clone(),
                path: path.to_string(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check that every mounted route has a rule.
    ///
    /// # Errors
    /// Returns [`RouteTableError::Unregistered`] listing the missing routes.
    pub fn ensure_registered<'a, I>(&self, routes: I) -> Result<(), RouteTableError>
    where
        I: IntoIterator<Item = (Method, &'a str)>,
    {
        let mut missing: Vec<String> = routes
            .into_iter()
            .filter(|(method, path)| self.lookup(method, path).is_err())
            .map(|(method, path)| format!("{method} {path}"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            Err(RouteTableError::Unregistered(missing))
        }
    }
}

fn parse_row(row: RouteRow) -> Result<RouteRule, RouteTableError> {
    let method = Method::from_bytes(row.method.trim().to_uppercase().as_bytes()).map_err(|_| {
        RouteTableError::InvalidMethod {
            method: row.method.clone(),
            path: row.path.clone(),
        }
    })?;

    let log_level = match row.log_level.as_deref().map(str::trim) {
        None | Some("") => Level::INFO,
        Some(level) => {
            Level::from_str(level).map_err(|_| RouteTableError::InvalidLogLevel {
                method: row.method.clone(),
                path: row.path.clone(),
                level: level.to_string(),
            })?
        }
    };

    Ok(RouteRule {
        method,
        path: row.path,
        handler: row.handler,
        chain: row.chain,
        roles: row.roles.unwrap_or_default(),
        log_level,
    })
}
