// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory database backend.
//!
//! [`MemoryCatalog`] implements [`Connector`] for hosts that want to register
//! Rust closures as procedures, and for tests. It models just enough of a
//! database for the pool:
//!
//! - named databases, each with an optional procedure catalog
//! - procedures defined as closures, registered per feature in order
//! - a key-value store with transactions and nested sub-transactions
//!
//! Writes made by a procedure go to the innermost open layer and reach the
//! shared store only on commit.

use crate::procedure::{BackendError, Connector, Feature, HookArgs, ProcedureOutput, QualifiedName, Session};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Signature of an in-memory procedure
pub type ProcedureFn =
    Arc<dyn Fn(&HookArgs<'_>, &mut Tx<'_>) -> Result<ProcedureOutput, BackendError> + Send + Sync>;

/// Pending writes of one (sub-)transaction level; `None` marks a delete
type Layer = BTreeMap<String, Option<String>>;

#[derive(Default)]
struct Database {
    catalog_installed: bool,
    procedures: HashMap<(String, String), ProcedureFn>,
    registrations: Vec<(Feature, String, String)>,
    store: BTreeMap<String, String>,
}

/// Shared in-memory catalog. Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    databases: Arc<Mutex<HashMap<String, Database>>>,
}

fn no_database(name: &str) -> BackendError {
    BackendError::new(format!("database \"{name}\" does not exist"))
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty database (no-op if it exists).
    pub fn create_database(&self, name: &str) {
        self.databases.lock().entry(name.to_string()).or_default();
    }

    pub fn drop_database(&self, name: &str) {
        self.databases.lock().remove(name);
    }

    fn with_db<T>(&self, name: &str, f: impl FnOnce(&mut Database) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let mut databases = self.databases.lock();
        let db = databases.get_mut(name).ok_or_else(|| no_database(name))?;
        f(db)
    }

    /// Install the procedure catalog in `database`.
    pub fn install_catalog(&self, database: &str) -> Result<(), BackendError> {
        self.with_db(database, |db| {
            db.catalog_installed = true;
            Ok(())
        })
    }

    /// Remove the catalog and every registration.
    pub fn uninstall_catalog(&self, database: &str) -> Result<(), BackendError> {
        self.with_db(database, |db| {
            db.catalog_installed = false;
            db.registrations.clear();
            Ok(())
        })
    }

    /// Define (or replace) procedure `schema.name`.
    pub fn define_procedure<F>(&self, database: &str, schema: &str, name: &str, f: F) -> Result<(), BackendError>
    where
        F: Fn(&HookArgs<'_>, &mut Tx<'_>) -> Result<ProcedureOutput, BackendError> + Send + Sync + 'static,
    {
        let f: ProcedureFn = Arc::new(f);
        self.with_db(database, |db| {
            db.procedures.insert((schema.to_string(), name.to_string()), f);
            Ok(())
        })
    }

    /// Register `schema.name` for `feature`, after every earlier registration.
    pub fn register(&self, database: &str, feature: Feature, schema: &str, name: &str) -> Result<(), BackendError> {
        self.with_db(database, |db| {
            if !db.catalog_installed {
                return Err(BackendError::new("procedure catalog is not installed"));
            }
            let key = (schema.to_string(), name.to_string());
            if !db.procedures.contains_key(&key) {
                return Err(BackendError::new(format!(
                    "procedure {schema}.{name} does not exist"
                )));
            }
            let entry = (feature, key.0, key.1);
            if db.registrations.contains(&entry) {
                return Err(BackendError::new(format!(
                    "{schema}.{name} is already registered for \"{feature}\""
                )));
            }
            db.registrations.push(entry);
            Ok(())
        })
    }

    pub fn unregister(&self, database: &str, feature: Feature, schema: &str, name: &str) -> Result<(), BackendError> {
        self.with_db(database, |db| {
            let before = db.registrations.len();
            db.registrations
                .retain(|(f, s, n)| !(*f == feature && s == schema && n == name));
            if db.registrations.len() == before {
                return Err(BackendError::new(format!(
                    "{schema}.{name} is not registered for \"{feature}\""
                )));
            }
            Ok(())
        })
    }

    /// Committed value of `key` in `database`
    #[must_use]
    pub fn committed_value(&self, database: &str, key: &str) -> Option<String> {
        self.databases
            .lock()
            .get(database)
            .and_then(|db| db.store.get(key).cloned())
    }

    /// Open a session on `database`
    pub fn session(&self, database: &str) -> Result<MemorySession, BackendError> {
        if !self.databases.lock().contains_key(database) {
            return Err(no_database(database));
        }
        Ok(MemorySession {
            catalog: self.clone(),
            database: database.to_string(),
            layers: Vec::new(),
        })
    }
}

impl Connector for MemoryCatalog {
    type Session = MemorySession;

    fn connect(&self, database: &str) -> Result<MemorySession, BackendError> {
        self.session(database)
    }

    fn database_exists(&self, database: &str) -> Result<bool, BackendError> {
        Ok(self.databases.lock().contains_key(database))
    }
}

/// Session on one database of a [`MemoryCatalog`].
pub struct MemorySession {
    catalog: MemoryCatalog,
    database: String,
    /// `layers[0]` is the transaction, the rest are sub-transactions
    layers: Vec<Layer>,
}

impl MemorySession {
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Open (sub-)transaction depth, 0 outside a transaction
    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    fn merge_top(&mut self) {
        if let Some(top) = self.layers.pop() {
            if let Some(parent) = self.layers.last_mut() {
                parent.extend(top);
            }
        }
    }
}

impl Session for MemorySession {
    fn begin(&mut self) -> Result<(), BackendError> {
        if !self.layers.is_empty() {
            return Err(BackendError::new("there is already a transaction in progress"));
        }
        self.layers.push(Layer::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        if self.layers.is_empty() {
            return Err(BackendError::new("there is no transaction in progress"));
        }
        while self.layers.len() > 1 {
            self.merge_top();
        }
        let writes = self.layers.pop().unwrap_or_default();
        self.catalog.with_db(&self.database, |db| {
            for (key, value) in writes {
                match value {
                    Some(v) => db.store.insert(key, v),
                    None => db.store.remove(&key),
                };
            }
            Ok(())
        })
    }

    fn rollback(&mut self) {
        self.layers.clear();
    }

    fn begin_subtransaction(&mut self) -> Result<(), BackendError> {
        if self.layers.is_empty() {
            return Err(BackendError::new("sub-transaction outside a transaction"));
        }
        self.layers.push(Layer::new());
        Ok(())
    }

    fn release_subtransaction(&mut self) -> Result<(), BackendError> {
        if self.layers.len() < 2 {
            return Err(BackendError::new("no sub-transaction in progress"));
        }
        self.merge_top();
        Ok(())
    }

    fn rollback_subtransaction(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    fn catalog_installed(&mut self) -> Result<bool, BackendError> {
        self.catalog.with_db(&self.database, |db| Ok(db.catalog_installed))
    }

    fn feature_entries(&mut self, feature: Feature) -> Result<Vec<(String, String)>, BackendError> {
        self.catalog.with_db(&self.database, |db| {
            Ok(db
                .registrations
                .iter()
                .filter(|(f, _, _)| *f == feature)
                .map(|(_, schema, name)| (schema.clone(), name.clone()))
                .collect())
        })
    }

    fn call(&mut self, procedure: &QualifiedName, args: &HookArgs<'_>) -> Result<ProcedureOutput, BackendError> {
        if self.layers.is_empty() {
            return Err(BackendError::new("procedure call outside a transaction"));
        }
        // Clone out so the catalog is not locked while the procedure runs
        let f = self.catalog.with_db(&self.database, |db| {
            db.procedures
                .get(&(procedure.schema().to_string(), procedure.name().to_string()))
                .cloned()
                .ok_or_else(|| BackendError::new(format!("function {procedure} does not exist")))
        })?;

        let mut tx = Tx {
            catalog: &self.catalog,
            database: &self.database,
            layers: &mut self.layers,
        };
        f(args, &mut tx)
    }
}

/// Key-value view of the open transaction, handed to procedures.
pub struct Tx<'a> {
    catalog: &'a MemoryCatalog,
    database: &'a str,
    layers: &'a mut Vec<Layer>,
}

impl Tx<'_> {
    /// Value as seen by this transaction
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.get(key) {
                return value.clone();
            }
        }
        self.catalog.committed_value(self.database, key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(top) = self.layers.last_mut() {
            top.insert(key.into(), Some(value.into()));
        }
    }

    pub fn delete(&mut self, key: &str) {
        if let Some(top) = self.layers.last_mut() {
            top.insert(key.to_string(), None);
        }
    }
}
