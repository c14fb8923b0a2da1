//! PostgreSQL warehouse sink.
//!
//! The dataset maps to a PostgreSQL schema and the table name to a table in
//! it. Each write runs in one transaction: create the table if needed (or
//! recreate it on a full refresh whose schema changed), truncate or check
//! emptiness, then a text `COPY` of the conformed rows. A failure at any
//! point rolls back, leaving the previous contents in place.
//!
//! With a staging location, rows are first copied into an unlogged table in
//! that schema and moved into the target at the end, so the target is only
//! locked for the final swap.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_postgres::Transaction;
use tracing::{debug, info};

use crate::core::schema::TableSchema;
use crate::core::traits::{ConnectionSpec, RowStream, TableSink};
use crate::core::value::{TableRow, Value};
use crate::deferred::DeferredValue;
use crate::error::{ExtractError, Result};
use crate::source::{connect_client, pg_config, redact_url, DEFAULT_DRIVER_CLASS};

use super::typemap::{column_definition, postgres_type, quote_ident};
use super::{CreateDisposition, WriteDisposition, WriteOutcome, WriteRequest};

/// Flush COPY data to the server once this many bytes are buffered.
const COPY_BUFFER_BYTES: usize = 1 << 20;

const TABLE_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM information_schema.tables
        WHERE table_schema = $1 AND table_name = $2
    )
"#;

const EXISTING_COLUMNS_SQL: &str = r#"
    SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attnotnull
    FROM pg_attribute a
    WHERE a.attrelid = to_regclass($1::text)
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// Column of an existing table: name, `format_type` spelling, NOT NULL.
type ExistingColumn = (String, String, bool);

/// Loads tables into a PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    url: DeferredValue<String>,
}

impl PostgresWarehouse {
    /// `url` is a `postgres://` or `jdbc:postgresql://` URL with credentials
    /// in userinfo or query parameters.
    pub fn new(url: impl Into<DeferredValue<String>>) -> Self {
        Self { url: url.into() }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client> {
        let url = self.url.resolve().await?;
        let spec = ConnectionSpec {
            driver_class_name: DEFAULT_DRIVER_CLASS.to_string(),
            url: url.clone(),
            username: None,
            password: None,
            properties: BTreeMap::new(),
        };
        let (config, ssl_mode) = pg_config(&spec)?;
        connect_client(
            &config,
            ssl_mode,
            &format!("connecting to sink {}", redact_url(url)),
        )
        .await
    }
}

fn step_failed(table: &str, step: &str, e: tokio_postgres::Error) -> ExtractError {
    ExtractError::write(table, format!("{}: {}", step, e))
}

#[async_trait]
impl TableSink for PostgresWarehouse {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn write(&self, request: WriteRequest, rows: RowStream) -> Result<WriteOutcome> {
        let table_name = request.table.to_string();
        if let Some(project) = &request.table.project {
            debug!("Ignoring project '{}' for PostgreSQL sink", project);
        }
        let target = format!(
            "{}.{}",
            quote_ident(&request.table.dataset),
            quote_ident(&request.table.table)
        );

        let mut client = self.connect().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| step_failed(&table_name, "BEGIN", e))?;

        let exists: bool = tx
            .query_one(TABLE_EXISTS_SQL, &[&request.table.dataset, &request.table.table])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|e| step_failed(&table_name, "checking table", e))?;

        let mut recreate = false;
        if !exists {
            if request.policy.create_disposition == CreateDisposition::CreateNever {
                return Err(ExtractError::write(
                    &table_name,
                    "table does not exist and create disposition is create_never",
                ));
            }
            let ddl = create_table_ddl(&target, &request.schema);
            debug!("{}", ddl);
            tx.batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}; {}",
                quote_ident(&request.table.dataset),
                ddl
            ))
            .await
            .map_err(|e| step_failed(&table_name, "creating table", e))?;
        } else {
            let existing = existing_columns(&tx, &target, &table_name).await?;
            if !schema_matches(&existing, &request.schema) {
                if request.policy.write_disposition != WriteDisposition::WriteTruncate {
                    return Err(ExtractError::write(
                        &table_name,
                        "existing table schema differs from the catalog schema",
                    ));
                }
                recreate = true;
            }
        }

        let rows_written = match request.policy.staging_location.as_deref() {
            Some(staging_schema) => {
                let staging = format!(
                    "{}.{}",
                    quote_ident(staging_schema),
                    quote_ident(&staging_table_name(&request))
                );
                debug!("Staging {} in {}", table_name, staging);
                tx.batch_execute(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}; {}",
                    quote_ident(staging_schema),
                    create_table_ddl(&staging, &request.schema)
                        .replacen("CREATE TABLE", "CREATE UNLOGGED TABLE", 1)
                ))
                .await
                .map_err(|e| step_failed(&table_name, "creating staging table", e))?;

                let written = copy_rows(&tx, &staging, &request, rows, &table_name).await?;
                apply_disposition(&tx, &target, &request, recreate, &table_name).await?;

                let columns = column_list(&request.schema);
                tx.batch_execute(&format!(
                    "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging}; DROP TABLE {staging}",
                    target = target,
                    columns = columns,
                    staging = staging
                ))
                .await
                .map_err(|e| step_failed(&table_name, "moving staged rows", e))?;
                written
            }
            None => {
                apply_disposition(&tx, &target, &request, recreate, &table_name).await?;
                copy_rows(&tx, &target, &request, rows, &table_name).await?
            }
        };

        tx.commit()
            .await
            .map_err(|e| step_failed(&table_name, "COMMIT", e))?;

        Ok(WriteOutcome {
            table: request.table,
            rows_written,
            created: !exists,
        })
    }
}

async fn existing_columns(
    tx: &Transaction<'_>,
    target: &str,
    table_name: &str,
) -> Result<Vec<ExistingColumn>> {
    let rows = tx
        .query(EXISTING_COLUMNS_SQL, &[&target])
        .await
        .map_err(|e| step_failed(table_name, "reading table columns", e))?;
    rows.iter()
        .map(|row| Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?)))
        .collect::<std::result::Result<Vec<ExistingColumn>, tokio_postgres::Error>>()
        .map_err(|e| step_failed(table_name, "reading table columns", e))
}

/// Whether an existing table has exactly the columns `schema` would create.
fn schema_matches(existing: &[ExistingColumn], schema: &TableSchema) -> bool {
    existing.len() == schema.fields.len()
        && existing
            .iter()
            .zip(&schema.fields)
            .all(|((name, column_type, not_null), field)| {
                *name == field.name
                    && column_type == postgres_type(field)
                    && *not_null == field.is_required()
            })
}

/// Prepare the target for this run's rows.
async fn apply_disposition(
    tx: &Transaction<'_>,
    target: &str,
    request: &WriteRequest,
    recreate: bool,
    table_name: &str,
) -> Result<()> {
    if recreate {
        info!("Schema of {} changed, recreating the table", table_name);
        let ddl = create_table_ddl(target, &request.schema);
        debug!("{}", ddl);
        return tx
            .batch_execute(&format!("DROP TABLE {}; {}", target, ddl))
            .await
            .map_err(|e| step_failed(table_name, "recreating table", e));
    }

    match request.policy.write_disposition {
        WriteDisposition::WriteTruncate => {
            tx.batch_execute(&format!("TRUNCATE TABLE {}", target))
                .await
                .map_err(|e| step_failed(table_name, "truncating", e))?;
        }
        WriteDisposition::WriteEmpty => {
            let has_rows: bool = tx
                .query_one(format!("SELECT EXISTS (SELECT 1 FROM {})", target).as_str(), &[])
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|e| step_failed(table_name, "checking emptiness", e))?;
            if has_rows {
                return Err(ExtractError::write(
                    table_name,
                    "table is not empty and write disposition is write_empty",
                ));
            }
        }
        WriteDisposition::WriteAppend => {}
    }
    Ok(())
}

/// Stream conformed rows into `into` with a text `COPY`.
async fn copy_rows(
    tx: &Transaction<'_>,
    into: &str,
    request: &WriteRequest,
    mut rows: RowStream,
    table_name: &str,
) -> Result<u64> {
    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
        into,
        column_list(&request.schema)
    );
    let sink = tx
        .copy_in(copy_sql.as_str())
        .await
        .map_err(|e| step_failed(table_name, "COPY init", e))?;
    tokio::pin!(sink);

    let mut buf = String::with_capacity(COPY_BUFFER_BYTES);
    while let Some(row) = rows.next().await {
        let row = request.conform(&row?)?;
        encode_copy_line(&request.schema, &row, &mut buf);
        if buf.len() >= COPY_BUFFER_BYTES {
            sink.send(Bytes::from(std::mem::take(&mut buf)))
                .await
                .map_err(|e| step_failed(table_name, "COPY send", e))?;
        }
    }
    if !buf.is_empty() {
        sink.send(Bytes::from(buf))
            .await
            .map_err(|e| step_failed(table_name, "COPY send", e))?;
    }
    sink.finish()
        .await
        .map_err(|e| step_failed(table_name, "COPY finish", e))
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .fields
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `<dataset>__<table>_<random>`, unique per write and within the 63-byte
/// identifier limit.
fn staging_table_name(request: &WriteRequest) -> String {
    let base: String = format!("{}__{}", request.table.dataset, request.table.table)
        .chars()
        .take(54)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", base, &suffix[..8])
}

fn create_table_ddl(target: &str, schema: &TableSchema) -> String {
    let columns = schema
        .fields
        .iter()
        .map(column_definition)
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", target, columns)
}

fn encode_copy_line(schema: &TableSchema, row: &TableRow, buf: &mut String) {
    for (i, field) in schema.fields.iter().enumerate() {
        if i > 0 {
            buf.push('\t');
        }
        buf.push_str(&value_to_text(row.get(&field.name).unwrap_or(&Value::Null)));
    }
    buf.push('\n');
}

/// Render a value in COPY text format.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => "\\N".to_string(),
        Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_nan() => "NaN".to_string(),
        Value::Float(f) if f.is_infinite() => {
            if *f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
        }
        Value::Float(f) => f.to_string(),
        Value::Numeric(d) => d.to_string(),
        Value::String(s) => escape_copy_text(s),
        Value::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        Value::Uuid(u) => u.to_string(),
        Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f+00").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        Value::Json(v) => escape_copy_text(&v.to_string()),
    }
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}
