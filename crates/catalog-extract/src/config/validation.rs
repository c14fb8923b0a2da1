//! Job configuration validation.

use super::{JobConfig, ParameterSpec, SinkKind};
use crate::error::{ExtractError, Result};
use crate::sink::{is_valid_dataset, QualifiedTableName};
use crate::source::parse_connection_properties;

/// Validate the configuration.
///
/// Only literal values are checked here. Parameters and environment
/// variables are checked when they resolve, and the driver class against
/// the registry the orchestrator is built with.
pub fn validate(config: &JobConfig) -> Result<()> {
    if config.catalog.as_os_str().is_empty() {
        return Err(ExtractError::Config("catalog is required".into()));
    }

    check_spec("source.driver_class_name", &config.source.driver_class_name)?;
    check_spec("source.connection_url", &config.source.connection_url)?;
    for (name, spec) in [
        ("source.username", &config.source.username),
        ("source.password", &config.source.password),
        ("source.connection_properties", &config.source.connection_properties),
        ("target.connection_url", &config.target.connection_url),
        ("kms.access_token", &config.kms.access_token),
    ] {
        if let Some(spec) = spec {
            check_reference(name, spec)?;
        }
    }

    if let Some(props) = config
        .source
        .connection_properties
        .as_ref()
        .and_then(ParameterSpec::as_literal)
    {
        parse_connection_properties(props)?;
    }

    check_spec("target.output_dataset", &config.target.output_dataset)?;
    if let Some(dataset) = config.target.output_dataset.as_literal() {
        QualifiedTableName::from_dataset(dataset, "t").map_err(|e| {
            ExtractError::Config(format!("target.output_dataset is invalid: {}", e))
        })?;
    }

    match (config.target.sink, &config.target.connection_url) {
        (SinkKind::Postgres, None) => {
            return Err(ExtractError::Config(
                "target.connection_url is required for the postgres sink".into(),
            ));
        }
        (SinkKind::Postgres, Some(url)) => check_spec("target.connection_url", url)?,
        (SinkKind::Memory, _) => {}
    }

    if let Some(staging) = &config.target.staging_location {
        if config.target.sink == SinkKind::Postgres && !is_valid_dataset(staging) {
            return Err(ExtractError::Config(format!(
                "target.staging_location '{}' must be a schema name: use letters, digits and underscores",
                staging
            )));
        }
    }

    if config.kms.endpoint.trim().is_empty() {
        return Err(ExtractError::Config("kms.endpoint must not be empty".into()));
    }

    if let Some(0) = config.execution.max_concurrent_stages {
        return Err(ExtractError::Config(
            "execution.max_concurrent_stages must be at least 1".into(),
        ));
    }
    if config.execution.fetch_batch_size == 0 {
        return Err(ExtractError::Config(
            "execution.fetch_batch_size must be at least 1".into(),
        ));
    }
    if config.execution.channel_capacity == 0 {
        return Err(ExtractError::Config(
            "execution.channel_capacity must be at least 1".into(),
        ));
    }

    Ok(())
}

/// A required value: literals must be non-empty.
fn check_spec(name: &str, spec: &ParameterSpec) -> Result<()> {
    check_reference(name, spec)?;
    if let Some(value) = spec.as_literal() {
        if value.trim().is_empty() {
            return Err(ExtractError::Config(format!("{} is required", name)));
        }
    }
    Ok(())
}

/// Parameter and environment variable names must be non-empty.
fn check_reference(name: &str, spec: &ParameterSpec) -> Result<()> {
    match spec {
        ParameterSpec::Param { param } if param.trim().is_empty() => Err(ExtractError::Config(
            format!("{}: parameter name must not be empty", name),
        )),
        ParameterSpec::Env { env } if env.trim().is_empty() => Err(ExtractError::Config(
            format!("{}: environment variable name must not be empty", name),
        )),
        _ => Ok(()),
    }
}
