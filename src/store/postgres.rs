//! `PostgreSQL` implementation of the store interface.
//!
//! Every named function is invoked with named notation and its rows are
//! converted server-side with `to_jsonb`:
//!
//! ```sql
//! SELECT to_jsonb(r) AS row FROM portier.validate_session(p_token_hash => $1, ...) AS r
//! ```
//!
//! `NULL` parameters are left out of the call so the function's declared
//! default applies. Integers are bound as `bigint`.

use super::{Operation, Param, Params, Store, StoreConnection, StoreError};
use crate::policy::RoleName;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    Executor, PgPool, Postgres, Row,
    pool::PoolConnection,
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
};
use std::time::Duration;
use tracing::{Instrument, debug};

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect the pool. Released connections drop any role they assumed.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("RESET ROLE").await?;
                    Ok(true)
                })
            })
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let span = tracing::info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let conn = self
            .pool
            .acquire()
            .instrument(span)
            .await
            .map_err(|err| StoreError::Acquire(err.to_string()))?;
        Ok(Box::new(PgStoreConnection { conn }))
    }
}

struct PgStoreConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl StoreConnection for PgStoreConnection {
    async fn fetch(
        &mut self,
        operation: Operation,
        name: &str,
        params: &Params,
    ) -> Result<Vec<Value>, StoreError> {
        let statement = function_statement(name, params)?;
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = operation.as_str(),
            db.statement = statement.as_str()
        );

        let mut query = sqlx::query(&statement);
        for (_, value) in params.iter() {
            query = bind(query, value);
        }

        let rows = query
            .fetch_all(&mut *self.conn)
            .instrument(span)
            .await
            .map_err(|err| database_error(name, &err))?;

        debug!(function = name, rows = rows.len(), "store function returned");

        rows.iter()
            .map(|row| {
                row.try_get::<Value, _>("row")
                    .map_err(|err| database_error(name, &err))
            })
            .collect()
    }

    async fn assume_role(&mut self, role: &RoleName) -> Result<(), StoreError> {
        // RoleName only admits plain identifiers, so quoting is sufficient.
        let statement = format!("SET ROLE \"{}\"", role.as_str());
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SET ROLE",
            db.statement = statement.as_str()
        );
        (&mut *self.conn)
            .execute(statement.as_str())
            .instrument(span)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::AssumeRole {
                role: role.to_string(),
                message: err.to_string(),
            })
    }
}

/// Build the `SELECT` for a named function call. Placeholders are numbered
/// in the order non-null parameters are bound.
fn function_statement(name: &str, params: &Params) -> Result<String, StoreError> {
    super::validate_function_name(name)?;
    let mut arguments = Vec::with_capacity(params.len());
    for (position, (param, _)) in params
        .iter()
        .filter(|(_, value)| !matches!(value, Param::Null))
        .enumerate()
    {
        if !super::is_identifier(param) {
            return Err(StoreError::InvalidIdentifier(param.to_string()));
        }
        arguments.push(format!("{param} => ${}", position + 1));
    }
    Ok(format!(
        "SELECT to_jsonb(r) AS row FROM {name}({}) AS r",
        arguments.join(", ")
    ))
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Param,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Param::Null => query,
        Param::Bool(value) => query.bind(*value),
        Param::Int(value) => query.bind(*value),
        Param::Text(value) => query.bind(value.as_str()),
        Param::TextArray(values) => query.bind(values.as_slice()),
        Param::Uuid(value) => query.bind(*value),
        Param::Bytes(value) => query.bind(value.as_slice()),
        Param::Timestamp(value) => query.bind(*value),
        Param::Json(value) => query.bind(value),
    }
}

fn database_error(name: &str, err: &sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database {
            name: name.to_string(),
            code: db_err.code().map(|code| code.to_string()),
            message: db_err.message().to_string(),
        },
        other => StoreError::Database {
            name: name.to_string(),
            code: None,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn statement_uses_named_notation() -> anyhow::Result<()> {
        let params = Params::new()
            .bind("p_token_hash", vec![1_u8, 2, 3])
            .bind("p_tenant_id", Uuid::nil());
        let statement = function_statement("portier.validate_session", &params)?;
        assert_eq!(
            statement,
            "SELECT to_jsonb(r) AS row FROM portier.validate_session(p_token_hash => $1, p_tenant_id => $2) AS r"
        );
        Ok(())
    }

    #[test]
    fn statement_skips_null_parameters() -> anyhow::Result<()> {
        let params = Params::new()
            .bind("p_a", None::<String>)
            .bind("p_b", "x");
        let statement = function_statement("portier.f", &params)?;
        assert_eq!(statement, "SELECT to_jsonb(r) AS row FROM portier.f(p_b => $1) AS r");
        Ok(())
    }

    #[test]
    fn statement_rejects_bad_identifiers() {
        assert!(function_statement("portier.f()--", &Params::new()).is_err());
        let params = Params::new().bind("p_a => 1); drop", "x");
        assert!(function_statement("portier.f", &params).is_err());
    }
}
