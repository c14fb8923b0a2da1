//! Source side: deferred data source configuration, drivers and the
//! dynamic reader.

mod mapper;
mod postgres;
mod reader;
mod registry;
pub mod tls;

pub use mapper::LabelRowMapper;
pub use postgres::{PostgresConnection, PostgresDriver};
pub(crate) use postgres::{connect_client, pg_config};
pub use reader::{DynamicReader, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FETCH_SIZE};
pub use registry::DriverRegistry;

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info};
use url::Url;

use crate::core::traits::{Connection, ConnectionSpec};
use crate::deferred::DeferredValue;
use crate::error::{ExtractError, Result};

/// Driver class used when none is configured.
pub const DEFAULT_DRIVER_CLASS: &str = "org.postgresql.Driver";

/// JDBC-style connection descriptor built entirely from deferred values.
///
/// Nothing is resolved and no connection is attempted until
/// [`DataSourceConfig::open_connection`]. Cloning yields a configuration
/// with the same resolution strategies and fresh memoization slots, which is
/// how each stage gets its own copy of the job-level template.
#[derive(Clone)]
pub struct DataSourceConfig {
    driver_class_name: DeferredValue<String>,
    url: DeferredValue<String>,
    username: Option<DeferredValue<String>>,
    password: Option<DeferredValue<String>>,
    connection_properties: Option<DeferredValue<BTreeMap<String, String>>>,
    drivers: Arc<DriverRegistry>,
}

impl DataSourceConfig {
    pub fn create(
        driver_class_name: impl Into<DeferredValue<String>>,
        url: impl Into<DeferredValue<String>>,
    ) -> Self {
        Self {
            driver_class_name: driver_class_name.into(),
            url: url.into(),
            username: None,
            password: None,
            connection_properties: None,
            drivers: Arc::new(DriverRegistry::with_builtins()),
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<DeferredValue<String>>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<DeferredValue<String>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Extra driver properties in `"k1=v1;k2=v2"` form, parsed on resolution.
    #[must_use]
    pub fn with_connection_properties(
        mut self,
        properties: impl Into<DeferredValue<String>>,
    ) -> Self {
        let properties: DeferredValue<String> = properties.into();
        self.connection_properties =
            Some(properties.map("connection_properties", |s| parse_connection_properties(&s)));
        self
    }

    /// Use `drivers` instead of the built-in registry.
    #[must_use]
    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// I/O-free check that every configured deferred value has its source set.
    pub fn check_available(&self) -> Result<()> {
        self.driver_class_name.check_available()?;
        self.url.check_available()?;
        for value in [&self.username, &self.password].into_iter().flatten() {
            value.check_available()?;
        }
        if let Some(props) = &self.connection_properties {
            props.check_available()?;
        }
        Ok(())
    }

    /// Validate the parts that are known at definition time.
    ///
    /// A static driver class must be registered, and a static URL must be
    /// accepted by that driver. Deferred parts are checked on resolution.
    pub fn validate_static(&self) -> Result<()> {
        let Some(class_name) = self.driver_class_name.peek() else {
            return Ok(());
        };
        let driver = self.drivers.require(class_name)?;
        if let Some(url) = self.url.peek() {
            if !driver.accepts_url(url) {
                return Err(ExtractError::Config(format!(
                    "Driver '{}' does not accept URL '{}'",
                    class_name,
                    redact_url(url)
                )));
            }
        }
        Ok(())
    }

    /// Resolve every deferred part into a connection descriptor.
    ///
    /// Values already memoized by this configuration are reused.
    pub async fn resolve_spec(&self) -> Result<ConnectionSpec> {
        self.check_available()?;

        let driver_class_name = self.driver_class_name.resolve().await?.trim().to_string();
        let url = self.url.resolve().await?.trim().to_string();
        let username = match &self.username {
            Some(v) => Some(v.resolve().await?.clone()),
            None => None,
        };
        let password = match &self.password {
            Some(v) => Some(SecretString::from(v.resolve().await?.clone())),
            None => None,
        };
        let properties = match &self.connection_properties {
            Some(v) => v.resolve().await?.clone(),
            None => BTreeMap::new(),
        };

        debug!(
            "Resolved data source: driver={} url={} user={}",
            driver_class_name,
            redact_url(&url),
            username.as_deref().unwrap_or("<none>")
        );

        Ok(ConnectionSpec {
            driver_class_name,
            url,
            username,
            password,
            properties,
        })
    }

    /// Resolve the configuration and open a physical connection.
    pub async fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let spec = self.resolve_spec().await?;
        let driver = self.drivers.require(&spec.driver_class_name)?;
        if !driver.accepts_url(&spec.url) {
            return Err(ExtractError::Config(format!(
                "Driver '{}' does not accept URL '{}'",
                spec.driver_class_name,
                redact_url(&spec.url)
            )));
        }

        info!(
            "Opening {} connection to {}",
            driver.name(),
            redact_url(&spec.url)
        );
        driver.connect(&spec).await
    }
}

impl std::fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("driver_class_name", &self.driver_class_name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password)
            .field("connection_properties", &self.connection_properties)
            .finish()
    }
}

/// Parse `"k1=v1;k2=v2"` connection properties. Empty segments are skipped.
pub fn parse_connection_properties(s: &str) -> Result<BTreeMap<String, String>> {
    let mut props = BTreeMap::new();
    for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            ExtractError::Config(format!(
                "Invalid connection property '{}': expected key=value",
                segment
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ExtractError::Config(format!(
                "Invalid connection property '{}': empty key",
                segment
            )));
        }
        props.insert(key.to_string(), value.trim().to_string());
    }
    Ok(props)
}

/// Split a leading `jdbc:` (any case) off a connection URL.
pub(crate) fn split_jdbc_prefix(url: &str) -> (&str, &str) {
    match url.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("jdbc:") => (prefix, &url[5..]),
        _ => ("", url),
    }
}

fn is_secret_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("password") || key == "pwd"
}

/// Remove credentials from a connection URL for logging.
///
/// The userinfo password and `password`-like query parameters are masked.
/// A URL that does not parse keeps only its scheme.
pub fn redact_url(url: &str) -> String {
    let (prefix, rest) = split_jdbc_prefix(url.trim());
    let mut parsed = match Url::parse(rest) {
        Ok(parsed) => parsed,
        Err(_) => {
            return match rest.split_once("://") {
                Some((scheme, _)) => format!("{}{}://***", prefix, scheme),
                None => "***".to_string(),
            };
        }
    };

    if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
        return format!("{}{}://***", prefix, parsed.scheme());
    }
    if parsed.query_pairs().any(|(key, _)| is_secret_param(&key)) {
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(key, value)| {
                let value = if is_secret_param(&key) {
                    "***".to_string()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }
    format!("{}{}", prefix, parsed)
}
