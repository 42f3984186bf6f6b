//! In-memory store for development and tests.
//!
//! Each stored function is replaced by a handler closure keyed by its name.
//! Calls to a name without a handler fail like an undefined function would.

use super::{Operation, Params, Store, StoreConnection, StoreError};
use crate::policy::RoleName;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

type Handler = Arc<dyn Fn(&Params) -> Result<Vec<Value>, StoreError> + Send + Sync>;

/// SQLSTATE for calls to a function the store does not know.
const UNDEFINED_FUNCTION: &str = "42883";

#[derive(Clone, Default)]
pub struct MemoryStore {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    calls: Arc<Mutex<Vec<(String, Params)>>>,
    roles: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a stored function name.
    #[must_use]
    pub fn on<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&Params) -> Result<Vec<Value>, StoreError> + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name.to_string(), Arc::new(handler));
        }
        self
    }

    /// Register a handler that always returns the same rows.
    #[must_use]
    pub fn rows(self, name: &str, rows: Vec<Value>) -> Self {
        self.on(name, move |_| Ok(rows.clone()))
    }

    /// Build the error a failing stored function would raise.
    #[must_use]
    pub fn database_error(name: &str, code: &str) -> StoreError {
        StoreError::Database {
            name: name.to_string(),
            code: Some(code.to_string()),
            message: format!("simulated failure ({code})"),
        }
    }

    /// Every function invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Params)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Parameters of the invocations of `name`.
    #[must_use]
    pub fn calls_to(&self, name: &str) -> Vec<Params> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| called == name)
            .map(|(_, params)| params)
            .collect()
    }

    /// Roles assumed by any connection, in order.
    #[must_use]
    pub fn assumed_roles(&self) -> Vec<String> {
        self.roles.lock().map(|roles| roles.clone()).unwrap_or_default()
    }

    /// Connections currently checked out.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn fetch(
        &mut self,
        _operation: Operation,
        name: &str,
        params: &Params,
    ) -> Result<Vec<Value>, StoreError> {
        super::validate_function_name(name)?;
        if let Ok(mut calls) = self.store.calls.lock() {
            calls.push((name.to_string(), params.clone()));
        }
        let handler = self
            .store
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(name).cloned());
        match handler {
            Some(handler) => handler(params),
            None => Err(StoreError::Database {
                name: name.to_string(),
                code: Some(UNDEFINED_FUNCTION.to_string()),
                message: format!("function {name} does not exist"),
            }),
        }
    }

    async fn assume_role(&mut self, role: &RoleName) -> Result<(), StoreError> {
        if let Ok(mut roles) = self.store.roles.lock() {
            roles.push(role.as_str().to_string());
        }
        Ok(())
    }
}
