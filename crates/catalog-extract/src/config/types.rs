//! Job configuration type definitions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::deferred::{DeferredValue, EnvSource, RuntimeParameters};
use crate::error::{ExtractError, Result};
use crate::secret::DEFAULT_KMS_ENDPOINT;
use crate::sink::{CreateDisposition, WriteDisposition, WritePolicy};
use crate::source::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_DRIVER_CLASS, DEFAULT_FETCH_SIZE};

/// Root configuration for one extract job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Path to the catalog document. Relative paths are resolved against
    /// the directory of the config file by [`JobConfig::load`].
    pub catalog: PathBuf,

    /// Source database connection.
    pub source: SourceConfig,

    /// Target warehouse.
    pub target: TargetConfig,

    /// Key reference used to decrypt the source URL and credentials.
    /// Empty or absent means the values are plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_encryption_key: Option<String>,

    #[serde(default)]
    pub kms: KmsConfig,

    /// Write behavior shared by every stage.
    #[serde(default)]
    pub write: WriteConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// A configuration scalar: a literal, a runtime parameter or an environment
/// variable.
///
/// ```yaml
/// connection_url: jdbc:postgresql://db:5432/app   # literal
/// username: { param: db_user }                    # bound at run time
/// password: { env: DB_PASSWORD }                  # read at resolution time
/// ```
///
/// Unquoted numbers and booleans are literals too, taken as YAML reads them:
/// `password: 0123` becomes `"123"` and `1.50` becomes `"1.5"`. Quote values
/// whose exact spelling matters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    Param { param: String },
    Env { env: String },
    Literal(#[serde(deserialize_with = "scalar_to_string")] String),
}

fn scalar_to_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        String(String),
        Int(i64),
        UInt(u64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::String(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::UInt(u) => u.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

impl ParameterSpec {
    pub fn literal(value: impl Into<String>) -> Self {
        ParameterSpec::Literal(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        ParameterSpec::Param { param: name.into() }
    }

    pub fn env(var: impl Into<String>) -> Self {
        ParameterSpec::Env { env: var.into() }
    }

    /// The literal value, if this is one.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            ParameterSpec::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Build the deferred value for this parameter, declaring runtime
    /// parameter slots in `params` as needed.
    pub fn to_deferred(&self, params: &mut RuntimeParameters) -> DeferredValue<String> {
        match self {
            ParameterSpec::Literal(value) => DeferredValue::from(value.as_str()),
            ParameterSpec::Param { param } => params.parameter(param),
            ParameterSpec::Env { env } => DeferredValue::from_source(EnvSource::new(env)),
        }
    }
}

impl fmt::Debug for ParameterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSpec::Literal(_) => f.write_str("Literal([REDACTED])"),
            ParameterSpec::Param { param } => write!(f, "Param({})", param),
            ParameterSpec::Env { env } => write!(f, "Env({})", env),
        }
    }
}

/// Source database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Driver class name (default: "org.postgresql.Driver").
    #[serde(default = "default_driver_class")]
    pub driver_class_name: ParameterSpec,

    /// JDBC-style connection URL.
    pub connection_url: ParameterSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<ParameterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ParameterSpec>,

    /// Extra driver properties, `"k1=v1;k2=v2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_properties: Option<ParameterSpec>,
}

/// Which warehouse implementation receives the rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// In-process store; nothing is persisted.
    Memory,
    #[default]
    Postgres,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Memory => f.write_str("memory"),
            SinkKind::Postgres => f.write_str("postgres"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(SinkKind::Memory),
            "postgres" => Ok(SinkKind::Postgres),
            other => Err(ExtractError::Config(format!(
                "Unknown sink '{}' (expected memory or postgres)",
                other
            ))),
        }
    }
}

/// Target warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Dataset every output table is written to, `[project:]dataset`.
    pub output_dataset: ParameterSpec,

    /// Schema holding staging tables for bulk loads (postgres sink). The
    /// memory sink ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_location: Option<String>,

    #[serde(default)]
    pub sink: SinkKind,

    /// Warehouse URL (postgres sink only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<ParameterSpec>,
}

/// Key-management client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    #[serde(default = "default_kms_endpoint")]
    pub endpoint: String,

    /// OAuth access token for the key-management API. Read from
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<ParameterSpec>,
}

/// Environment variable holding the key-management access token by default.
pub const DEFAULT_ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

impl KmsConfig {
    pub fn access_token_spec(&self) -> ParameterSpec {
        self.access_token
            .clone()
            .unwrap_or_else(|| ParameterSpec::env(DEFAULT_ACCESS_TOKEN_ENV))
    }
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_kms_endpoint(),
            access_token: None,
        }
    }
}

/// Write dispositions. Defaults give a full refresh of every table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    #[serde(default)]
    pub create_disposition: CreateDisposition,

    #[serde(default)]
    pub write_disposition: WriteDisposition,

    /// Drop row fields that are not in the schema instead of failing.
    #[serde(default = "default_true")]
    pub ignore_unknown_values: bool,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            create_disposition: CreateDisposition::default(),
            write_disposition: WriteDisposition::default(),
            ignore_unknown_values: true,
        }
    }
}

impl WriteConfig {
    pub fn to_policy(&self, staging_location: Option<&str>) -> WritePolicy {
        WritePolicy {
            create_disposition: self.create_disposition,
            write_disposition: self.write_disposition,
            ignore_unknown_values: self.ignore_unknown_values,
            staging_location: staging_location.map(str::to_string),
        }
    }
}

/// Local execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum stages running at once. All stages run together if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_stages: Option<usize>,

    /// Rows fetched from the source per round trip.
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    /// Row batches buffered between a reader and its writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: None,
            fetch_batch_size: default_fetch_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_driver_class() -> ParameterSpec {
    ParameterSpec::literal(DEFAULT_DRIVER_CLASS)
}

fn default_kms_endpoint() -> String {
    DEFAULT_KMS_ENDPOINT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_fetch_batch_size() -> usize {
    DEFAULT_FETCH_SIZE
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
