//! Driver registry keyed by driver class name.
//!
//! The registry is built explicitly and injected into data source
//! configurations; there is no process-wide driver table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::traits::Driver;
use crate::error::{ExtractError, Result};

use super::postgres::PostgresDriver;

/// Registered drivers by class name.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in PostgreSQL driver registered under
    /// `org.postgresql.Driver`, `postgresql` and `postgres`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let postgres: Arc<dyn Driver> = Arc::new(PostgresDriver::new());
        for name in ["org.postgresql.Driver", "postgresql", "postgres"] {
            registry.register(name, postgres.clone());
        }
        registry
    }

    /// Register a driver, replacing any driver already registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name.trim()).cloned()
    }

    /// Get a driver by class name, returning a configuration error if unknown.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.get(name).ok_or_else(|| {
            ExtractError::Config(format!(
                "Unknown driver class '{}'. Registered drivers: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name.trim())
    }

    /// Registered class names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
