//! Runtime parameters: named slots declared at job-definition time and bound
//! at execution time.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use super::{DeferredValue, ValueSource};
use crate::error::{ExtractError, Result};

/// Named runtime parameter slots for one job.
///
/// Cloning shares the declared slots, so a clone kept by the execution layer
/// can bind values that deferred values created earlier will observe.
#[derive(Debug, Clone, Default)]
pub struct RuntimeParameters {
    slots: BTreeMap<String, Arc<OnceLock<String>>>,
}

impl RuntimeParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or reuse) the slot `name` and return a deferred value reading it.
    ///
    /// Every call returns a value with its own memoization slot.
    pub fn parameter(&mut self, name: &str) -> DeferredValue<String> {
        let slot = self
            .slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();
        DeferredValue::from_source(ParameterSource {
            name: name.to_string(),
            slot,
        })
    }

    /// Bind a value to a declared parameter. Each slot can be bound once.
    pub fn bind(&self, name: &str, value: impl Into<String>) -> Result<()> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| ExtractError::Config(format!("Unknown runtime parameter '{}'", name)))?;
        slot.set(value.into()).map_err(|_| {
            ExtractError::Config(format!("Runtime parameter '{}' is already bound", name))
        })
    }

    /// Names of all declared parameters.
    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Names of declared parameters that have no value yet.
    pub fn unbound(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.get().is_none())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Reads a runtime parameter slot.
#[derive(Debug)]
pub struct ParameterSource {
    name: String,
    slot: Arc<OnceLock<String>>,
}

#[async_trait]
impl ValueSource<String> for ParameterSource {
    async fn produce(&self) -> Result<String> {
        self.check_available()?;
        Ok(self.slot.get().cloned().unwrap_or_default())
    }

    fn check_available(&self) -> Result<()> {
        match self.slot.get() {
            Some(_) => Ok(()),
            None => Err(ExtractError::missing(format!("parameter '{}'", self.name))),
        }
    }

    fn describe(&self) -> String {
        format!("param:{}", self.name)
    }
}

/// Reads an environment variable at resolution time. Empty counts as unset.
#[derive(Debug)]
pub struct EnvSource {
    var: String,
}

impl EnvSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn read(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl ValueSource<String> for EnvSource {
    async fn produce(&self) -> Result<String> {
        self.read()
            .ok_or_else(|| ExtractError::missing(format!("environment variable {}", self.var)))
    }

    fn check_available(&self) -> Result<()> {
        self.read()
            .map(|_| ())
            .ok_or_else(|| ExtractError::missing(format!("environment variable {}", self.var)))
    }

    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbound_parameter_is_missing() {
        let mut params = RuntimeParameters::new();
        let password = params.parameter("password");

        let err = password.check_available().unwrap_err();
        assert!(matches!(err, ExtractError::ConfigurationMissing { ref name } if name == "parameter 'password'"));
        assert!(password.resolve().await.is_err());
        assert_eq!(params.unbound(), vec!["password".to_string()]);
    }

    #[tokio::test]
    async fn test_bind_after_definition() {
        let mut params = RuntimeParameters::new();
        let url = params.parameter("connection_url");
        let binder = params.clone();

        binder
            .bind("connection_url", "jdbc:postgresql://db:5432/app")
            .unwrap();

        assert!(url.check_available().is_ok());
        assert_eq!(url.resolve().await.unwrap(), "jdbc:postgresql://db:5432/app");
        assert!(params.unbound().is_empty());
    }

    #[test]
    fn test_bind_rejects_unknown_and_rebinding() {
        let mut params = RuntimeParameters::new();
        let _ = params.parameter("username");

        assert!(params.bind("nope", "x").is_err());
        params.bind("username", "etl").unwrap();
        assert!(params.bind("username", "other").is_err());
    }

    #[tokio::test]
    async fn test_same_parameter_yields_independent_values() {
        let mut params = RuntimeParameters::new();
        let a = params.parameter("dataset");
        let b = params.parameter("dataset");
        params.bind("dataset", "warehouse").unwrap();

        assert_eq!(a.resolve().await.unwrap(), "warehouse");
        assert!(a.is_resolved());
        assert!(!b.is_resolved());
        assert_eq!(params.declared().count(), 1);
    }

    #[tokio::test]
    async fn test_env_source_reads_at_resolution_time() {
        let var = "CATALOG_EXTRACT_TEST_ENV_SOURCE";
        let value = DeferredValue::from_source(EnvSource::new(var));
        assert!(value.check_available().is_err());

        std::env::set_var(var, "from-env");
        assert_eq!(value.resolve().await.unwrap(), "from-env");
        std::env::remove_var(var);
    }
}
