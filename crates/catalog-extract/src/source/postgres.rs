//! PostgreSQL driver on tokio-postgres.
//!
//! Accepts `jdbc:postgresql://`, `postgresql://` and `postgres://` URLs.
//! Queries run inside a read-only transaction through a portal so that large
//! result sets are pulled `fetch_size` rows at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use percent_encoding::percent_decode_str;
use secrecy::ExposeSecret;
use tokio_postgres::{Client, Config as PgConfig, NoTls, Portal, Row, Transaction};
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::core::traits::{Connection, ConnectionSpec, Driver, ResultStream};
use crate::core::value::{ColumnMeta, ResultRow, Value};
use crate::error::{BoxError, ExtractError, Result};

use super::{redact_url, split_jdbc_prefix};
use super::tls::{tls_connector, SslMode};

const DEFAULT_PORT: u16 = 5432;

/// Column types the driver can decode into [`Value`]s.
const SUPPORTED_TYPES: &[&str] = &[
    "bool",
    "int2",
    "int4",
    "int8",
    "oid",
    "float4",
    "float8",
    "numeric",
    "text",
    "varchar",
    "bpchar",
    "name",
    "citext",
    "unknown",
    "bytea",
    "uuid",
    "timestamp",
    "timestamptz",
    "date",
    "time",
    "json",
    "jsonb",
];

/// PostgreSQL source driver.
#[derive(Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn accepts_url(&self, url: &str) -> bool {
        let url = url.trim().to_ascii_lowercase();
        let url = url.strip_prefix("jdbc:").unwrap_or(&url);
        url.starts_with("postgresql://") || url.starts_with("postgres://")
    }

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn Connection>> {
        let (config, ssl_mode) = pg_config(spec)?;
        let context = format!("connecting to {}", redact_url(&spec.url));
        let client = connect_client(&config, ssl_mode, &context).await?;
        info!("Connected to PostgreSQL source: {}", describe(&config));
        Ok(Box::new(PostgresConnection { client }))
    }
}

/// Open a client and spawn its connection task.
pub(crate) async fn connect_client(
    config: &PgConfig,
    ssl_mode: SslMode,
    context: &str,
) -> Result<Client> {
    match tls_connector(ssl_mode)? {
        Some(tls) => {
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| ExtractError::connection(context, e))?;
            spawn_connection(connection);
            Ok(client)
        }
        None => {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| ExtractError::connection(context, e))?;
            spawn_connection(connection);
            Ok(client)
        }
    }
}

fn spawn_connection<F>(connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("PostgreSQL connection closed with error: {}", e);
        }
    });
}

/// Build a tokio-postgres config from a resolved connection descriptor.
///
/// Precedence, lowest first: URL userinfo, connection properties, URL query
/// parameters, explicit username/password.
pub(crate) fn pg_config(spec: &ConnectionSpec) -> Result<(PgConfig, SslMode)> {
    let parsed = parse_url(&spec.url)?;
    let mut config = PgConfig::new();
    config.host(parsed.host.as_str());
    config.port(parsed.port.unwrap_or(DEFAULT_PORT));
    if let Some(dbname) = &parsed.dbname {
        config.dbname(dbname.as_str());
    }
    if let Some(user) = &parsed.user {
        config.user(user.as_str());
    }
    if let Some(password) = &parsed.password {
        config.password(password.as_str());
    }

    let mut props = PropertyState::default();
    let pairs = spec
        .properties
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain(parsed.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in pairs {
        props.apply(&mut config, key, value)?;
    }

    if let Some(username) = &spec.username {
        config.user(username.as_str());
    }
    if let Some(password) = &spec.password {
        config.password(password.expose_secret());
    }
    if !props.options.is_empty() {
        config.options(props.options.join(" ").as_str());
    }

    Ok((config, props.ssl_mode))
}

#[derive(Default)]
struct PropertyState {
    ssl_mode: SslMode,
    options: Vec<String>,
}

impl PropertyState {
    fn apply(&mut self, config: &mut PgConfig, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "user" => {
                config.user(value);
            }
            "password" => {
                config.password(value);
            }
            "dbname" | "database" => {
                config.dbname(value);
            }
            "options" => self.options.push(value.to_string()),
            "currentschema" => self.options.push(format!("-c search_path={}", value)),
            "applicationname" | "application_name" => {
                config.application_name(value);
            }
            "connecttimeout" | "connect_timeout" | "logintimeout" => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    ExtractError::Config(format!(
                        "Invalid {} '{}': expected whole seconds",
                        key, value
                    ))
                })?;
                if secs > 0 {
                    config.connect_timeout(Duration::from_secs(secs));
                }
            }
            "sslmode" => self.ssl_mode = value.parse()?,
            "ssl" => {
                if value.eq_ignore_ascii_case("true") && !self.ssl_mode.requires_tls() {
                    self.ssl_mode = SslMode::Require;
                }
            }
            _ => debug!("Ignoring unsupported PostgreSQL connection property '{}'", key),
        }
        Ok(())
    }
}

/// Components of a PostgreSQL connection URL, percent-decoded.
#[derive(Debug, Default, PartialEq)]
struct ParsedUrl {
    host: String,
    port: Option<u16>,
    dbname: Option<String>,
    user: Option<String>,
    password: Option<String>,
    params: Vec<(String, String)>,
}

fn parse_url(raw: &str) -> Result<ParsedUrl> {
    let invalid = |reason: String| {
        ExtractError::Config(format!(
            "Invalid PostgreSQL URL '{}': {}",
            redact_url(raw),
            reason
        ))
    };

    let (_, rest) = split_jdbc_prefix(raw.trim());
    let url = Url::parse(rest).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "postgresql" | "postgres") {
        return Err(invalid(format!(
            "unsupported scheme '{}', expected jdbc:postgresql://, postgresql:// or postgres://",
            url.scheme()
        )));
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => decode(domain),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => "localhost".to_string(),
    };
    let dbname = decode(url.path().trim_start_matches('/'));

    Ok(ParsedUrl {
        host,
        port: url.port(),
        dbname: Some(dbname).filter(|d| !d.is_empty()),
        user: Some(decode(url.username())).filter(|u| !u.is_empty()),
        password: url.password().map(decode),
        params: url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect(),
    })
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn describe(config: &PgConfig) -> String {
    let hosts = config
        .get_hosts()
        .iter()
        .map(|h| match h {
            tokio_postgres::config::Host::Tcp(host) => host.clone(),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(path) => path.display().to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{}/{}", hosts, config.get_dbname().unwrap_or(""))
}

/// An open PostgreSQL source connection.
pub struct PostgresConnection {
    client: Client,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn query<'a>(&'a mut self, sql: &str, fetch_size: usize) -> Result<ResultStream<'a>> {
        let tx = self
            .client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|e| ExtractError::query(sql, e))?;
        let statement = tx.prepare(sql).await.map_err(|e| ExtractError::query(sql, e))?;

        let columns: Arc<[ColumnMeta]> = statement
            .columns()
            .iter()
            .map(|c| ColumnMeta::new(c.name(), c.type_().name()))
            .collect();
        if let Some(col) = columns
            .iter()
            .find(|c| !SUPPORTED_TYPES.contains(&c.type_name.as_str()))
        {
            return Err(ExtractError::query(
                sql,
                format!("column '{}' has unsupported type {}", col.label, col.type_name),
            ));
        }

        let portal = tx
            .bind(&statement, &[])
            .await
            .map_err(|e| ExtractError::query(sql, e))?;
        debug!(
            "Opened portal with {} columns, fetching {} rows per round trip",
            columns.len(),
            fetch_size
        );

        let cursor = PortalCursor {
            tx: Some(tx),
            portal,
            columns,
            max_rows: i32::try_from(fetch_size).unwrap_or(i32::MAX),
            sql: sql.to_string(),
        };

        let rows = stream::try_unfold(cursor, PortalCursor::next_page)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed();
        Ok(rows)
    }

    async fn close(self: Box<Self>) {
        debug!("Closing PostgreSQL source connection");
        drop(self.client);
    }
}

/// Pages through a bound portal. The transaction is committed once the
/// portal is exhausted and rolled back if the cursor is dropped early.
struct PortalCursor<'a> {
    tx: Option<Transaction<'a>>,
    portal: Portal,
    columns: Arc<[ColumnMeta]>,
    max_rows: i32,
    sql: String,
}

impl<'a> PortalCursor<'a> {
    async fn next_page(mut self) -> Result<Option<(Vec<ResultRow>, Self)>> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(None);
        };
        let rows = tx
            .query_portal(&self.portal, self.max_rows)
            .await
            .map_err(|e| ExtractError::query(&self.sql, e))?;
        let exhausted = self.max_rows <= 0 || rows.len() < self.max_rows as usize;

        let page = rows
            .iter()
            .map(|row| decode_row(row, &self.columns))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ExtractError::query(&self.sql, e))?;

        if exhausted {
            if let Some(tx) = self.tx.take() {
                tx.commit()
                    .await
                    .map_err(|e| ExtractError::query(&self.sql, e))?;
            }
            if page.is_empty() {
                return Ok(None);
            }
        }
        Ok(Some((page, self)))
    }
}

fn decode_row(row: &Row, columns: &Arc<[ColumnMeta]>) -> std::result::Result<ResultRow, BoxError> {
    let values = columns
        .iter()
        .enumerate()
        .map(|(idx, col)| decode_value(row, idx, &col.type_name))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ResultRow::new(columns.clone(), values))
}

fn decode_value(row: &Row, idx: usize, type_name: &str) -> std::result::Result<Value, BoxError> {
    let value: Value = match type_name {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.into(),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.into(),
        "oid" => row.try_get::<_, Option<u32>>(idx)?.map(i64::from).into(),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.into(),
        "numeric" => row.try_get::<_, Option<rust_decimal::Decimal>>(idx)?.into(),
        "text" | "varchar" | "bpchar" | "name" | "citext" | "unknown" => {
            row.try_get::<_, Option<String>>(idx)?.into()
        }
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.into(),
        "uuid" => row.try_get::<_, Option<uuid::Uuid>>(idx)?.into(),
        "timestamp" => row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?.into(),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .into(),
        "date" => row.try_get::<_, Option<chrono::NaiveDate>>(idx)?.into(),
        "time" => row.try_get::<_, Option<chrono::NaiveTime>>(idx)?.into(),
        "json" | "jsonb" => row.try_get::<_, Option<serde_json::Value>>(idx)?.into(),
        other => return Err(format!("unsupported column type {}", other).into()),
    };
    Ok(value)
}
