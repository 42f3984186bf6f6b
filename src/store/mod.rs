//! Narrow interface to the persistent store.
//!
//! All business logic lives in stored functions. The gatekeeper only needs to
//! check out a connection, run named read queries, call named procedures with
//! named parameters, and switch the connection's role for the rest of the
//! request. Rows travel as JSON objects and are decoded into typed records at
//! this boundary.

use crate::policy::RoleName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// SQLSTATE raised by the store for unique constraint violations.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to acquire store connection: {0}")]
    Acquire(String),
    #[error("invalid store identifier: {0}")]
    InvalidIdentifier(String),
    #[error("store function {name} failed (code {code:?}): {message}")]
    Database {
        name: String,
        code: Option<String>,
        message: String,
    },
    #[error("failed to decode row from {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to assume role {role}: {message}")]
    AssumeRole { role: String, message: String },
}

impl StoreError {
    /// SQLSTATE code reported by the store, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Whether a named function is invoked as a read query or as a procedure call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Query,
    Call,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "SELECT",
            Self::Call => "CALL",
        }
    }
}

/// A single bound parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    TextArray(Vec<String>),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl Param {
    /// JSON view of the value, used by the in-memory store and for logging.
    /// Bytes are rendered as lowercase hex.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
            Self::TextArray(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
            Self::Uuid(value) => Value::String(value.to_string()),
            Self::Bytes(value) => Value::String(hex::encode(value)),
            Self::Timestamp(value) => Value::String(value.to_rfc3339()),
            Self::Json(value) => value.clone(),
        }
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for Param {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<Uuid> for Param {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Vec<u8>> for Param {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Named parameters, kept in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Param)>,
}

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, name: &str, value: impl Into<Param>) -> Self {
        self.entries.push((name.to_string(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Decode a parameter through its JSON view.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get(name)
            .and_then(|value| serde_json::from_value(value.to_json()).ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parameter names and JSON values, suitable for span fields.
    #[must_use]
    pub fn to_json_map(&self) -> BTreeMap<String, Value> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }
}

impl fmt::Display for Params {
    // Values are left out on purpose: they carry token hashes and secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|(name, _)| name).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Result of a procedure call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Rows(Vec<Value>),
    /// The store raised one of the codes the caller declared non-fatal.
    Tolerated(String),
}

/// Source of request-scoped store connections.
#[async_trait]
pub trait Store: Send + Sync {
    /// Check out a connection. It goes back to the pool when dropped.
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// A checked-out connection.
#[async_trait]
pub trait StoreConnection: Send {
    /// Run the named function and return its rows as JSON objects.
    async fn fetch(
        &mut self,
        operation: Operation,
        name: &str,
        params: &Params,
    ) -> Result<Vec<Value>, StoreError>;

    /// Switch the connection to `role` for the rest of its checkout.
    async fn assume_role(&mut self, role: &RoleName) -> Result<(), StoreError>;
}

/// Run a named read query and decode every row into `T`.
///
/// # Errors
/// Returns an error if the store rejects the query or a row does not decode.
pub async fn query<T: DeserializeOwned>(
    conn: &mut dyn StoreConnection,
    name: &str,
    params: &Params,
) -> Result<Vec<T>, StoreError> {
    let rows = conn.fetch(Operation::Query, name, params).await?;
    decode_rows(name, rows)
}

/// Call a named procedure. Store errors whose SQLSTATE code is listed in
/// `tolerated` come back as [`CallOutcome::Tolerated`].
///
/// # Errors
/// Returns any other store error.
pub async fn call(
    conn: &mut dyn StoreConnection,
    name: &str,
    params: &Params,
    tolerated: &[&str],
) -> Result<CallOutcome, StoreError> {
    match conn.fetch(Operation::Call, name, params).await {
        Ok(rows) => Ok(CallOutcome::Rows(rows)),
        Err(err) => match err.code() {
            Some(code) if tolerated.contains(&code) => {
                tracing::debug!(procedure = name, code, "tolerated store error");
                Ok(CallOutcome::Tolerated(code.to_string()))
            }
            _ => Err(err),
        },
    }
}

/// Call a procedure that tolerates nothing and decode its rows.
///
/// # Errors
/// Returns an error if the call fails or a row does not decode.
pub async fn call_as<T: DeserializeOwned>(
    conn: &mut dyn StoreConnection,
    name: &str,
    params: &Params,
) -> Result<Vec<T>, StoreError> {
    let rows = conn.fetch(Operation::Call, name, params).await?;
    decode_rows(name, rows)
}

/// Decode JSON rows into typed records.
///
/// # Errors
/// Returns [`StoreError::Decode`] naming the function on the first bad row.
pub fn decode_rows<T: DeserializeOwned>(name: &str, rows: Vec<Value>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|source| StoreError::Decode {
                name: name.to_string(),
                source,
            })
        })
        .collect()
}

/// Validate a (optionally schema-qualified) function name before it is
/// interpolated into SQL.
///
/// # Errors
/// Returns [`StoreError::InvalidIdentifier`] for anything but
/// `ident` or `schema.ident` made of lowercase letters, digits and `_`.
pub fn validate_function_name(name: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = (1..=2).contains(&parts.len()) && parts.iter().all(|part| is_identifier(part));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

pub(crate) fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_lowercase() || first == '_')
        && value.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
