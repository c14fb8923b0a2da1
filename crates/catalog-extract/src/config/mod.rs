//! Job configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{ExtractError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl JobConfig {
    /// Load configuration from a YAML file.
    ///
    /// A relative `catalog` path is resolved against the directory holding
    /// the config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        if config.catalog.is_relative() {
            if let Some(dir) = path.parent() {
                config.catalog = dir.join(&config.catalog);
            }
        }
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: JobConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA-256 of the normalized configuration, for run reports.
    pub fn fingerprint(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
