//! Sink side: write policy, qualified table names and warehouse sinks.
//!
//! The default [`WritePolicy`] is a full refresh: create the table from the
//! catalog schema if it is absent, replace its contents with the rows of the
//! current run, and drop row fields the schema does not declare.

mod memory;
mod postgres;
pub mod typemap;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::core::schema::TableSchema;
use crate::core::traits::{RowStream, TableSink};
use crate::core::value::{TableRow, Value};
use crate::deferred::DeferredValue;
use crate::error::{ExtractError, Result};

/// Whether the sink may create a missing target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateDisposition {
    #[default]
    CreateIfNeeded,
    CreateNever,
}

/// What happens to existing table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Replace the table contents with the rows of this run.
    #[default]
    WriteTruncate,
    /// Append to existing contents.
    WriteAppend,
    /// Fail unless the table is empty.
    WriteEmpty,
}

/// Per-stage write behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePolicy {
    #[serde(default)]
    pub create_disposition: CreateDisposition,

    #[serde(default)]
    pub write_disposition: WriteDisposition,

    /// Drop row fields that are not in the schema instead of failing.
    #[serde(default = "default_true")]
    pub ignore_unknown_values: bool,

    /// Where the sink stages rows before moving them into the target. For
    /// PostgreSQL this is a schema name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_location: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::full_refresh()
    }
}

impl WritePolicy {
    /// Create if needed, truncate and load, ignore unknown fields.
    pub fn full_refresh() -> Self {
        Self {
            create_disposition: CreateDisposition::CreateIfNeeded,
            write_disposition: WriteDisposition::WriteTruncate,
            ignore_unknown_values: true,
            staging_location: None,
        }
    }

    #[must_use]
    pub fn with_staging_location(mut self, location: impl Into<String>) -> Self {
        self.staging_location = Some(location.into());
        self
    }

    /// Project `row` onto `schema`.
    ///
    /// Fields are matched by name ignoring ASCII case and emitted in schema
    /// order under the schema's names. Missing fields become NULL. Unknown
    /// fields are dropped or rejected depending on `ignore_unknown_values`.
    /// NULL in a REQUIRED field is a write error.
    pub fn conform_row(
        &self,
        schema: &TableSchema,
        table: &QualifiedTableName,
        row: &TableRow,
    ) -> Result<TableRow> {
        if !self.ignore_unknown_values {
            if let Some(unknown) = row.names().find(|name| schema.field(name).is_none()) {
                return Err(ExtractError::UnknownField {
                    table: table.to_string(),
                    field: unknown.to_string(),
                });
            }
        } else {
            for unknown in row.names().filter(|name| schema.field(name).is_none()) {
                trace!("Dropping field '{}' not declared by {}", unknown, table);
            }
        }

        let mut out = TableRow::with_capacity(schema.len());
        for field in &schema.fields {
            let value = row.get_ignore_case(&field.name).cloned().unwrap_or(Value::Null);
            if value.is_null() && field.is_required() {
                return Err(ExtractError::write(
                    table.to_string(),
                    format!("REQUIRED field '{}' is missing or NULL", field.name),
                ));
            }
            out.set(field.name.as_str(), value);
        }
        Ok(out)
    }
}

/// Fully qualified warehouse table: `[project:]dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTableName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl QualifiedTableName {
    pub fn new(
        project: Option<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self> {
        let name = Self {
            project,
            dataset: dataset.into(),
            table: table.into(),
        };
        name.validate()?;
        Ok(name)
    }

    /// Combine a dataset reference (`dataset`, `project:dataset` or
    /// `project.dataset`) with a table name.
    pub fn from_dataset(dataset: &str, table: &str) -> Result<Self> {
        let dataset = dataset.trim();
        let (project, dataset) = match dataset.split_once(':').or_else(|| dataset.split_once('.')) {
            Some((project, dataset)) => (Some(project.to_string()), dataset),
            None => (None, dataset),
        };
        Self::new(project, dataset, table)
    }

    /// A deferred qualified name, resolved once per writer from a deferred
    /// dataset reference. A static, valid dataset gives a static name.
    pub fn deferred(
        dataset: DeferredValue<String>,
        table: impl Into<String>,
    ) -> DeferredValue<QualifiedTableName> {
        let table = table.into();
        if let Some(name) = dataset
            .peek()
            .and_then(|ds| QualifiedTableName::from_dataset(ds, &table).ok())
        {
            return DeferredValue::from_static(name);
        }
        dataset.map("qualified_table", move |dataset| {
            QualifiedTableName::from_dataset(&dataset, &table)
        })
    }

    fn validate(&self) -> Result<()> {
        if let Some(project) = &self.project {
            if project.is_empty()
                || !project
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ExtractError::Config(format!("Invalid project id '{}'", project)));
            }
        }
        if !is_valid_dataset(&self.dataset) {
            return Err(ExtractError::Config(format!(
                "Invalid dataset '{}': use letters, digits and underscores",
                self.dataset
            )));
        }
        if !is_valid_table_name(&self.table) {
            return Err(ExtractError::Config(format!(
                "Invalid table name '{}': use letters, digits, underscores and hyphens",
                self.table
            )));
        }
        Ok(())
    }
}

impl fmt::Display for QualifiedTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}:{}.{}", project, self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

impl FromStr for QualifiedTableName {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        let (dataset_ref, table) = s.trim().rsplit_once('.').ok_or_else(|| {
            ExtractError::Config(format!(
                "Invalid table reference '{}': expected [project:]dataset.table",
                s
            ))
        })?;
        Self::from_dataset(dataset_ref, table)
    }
}

pub(crate) fn is_valid_dataset(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 1024
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Table names: letters, digits, underscores and hyphens, at most 1024 chars.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 1024
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Everything a sink needs to load one table.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub table: QualifiedTableName,
    pub schema: Arc<TableSchema>,
    pub policy: WritePolicy,
}

impl WriteRequest {
    /// Conform one row to the request's schema and policy.
    pub fn conform(&self, row: &TableRow) -> Result<TableRow> {
        self.policy.conform_row(&self.schema, &self.table, row)
    }
}

/// Result of a successful table load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub table: QualifiedTableName,
    pub rows_written: u64,
    /// Whether the table was created by this write.
    pub created: bool,
}

/// Per-stage writer: resolves the target table name, then hands the rows to
/// the sink with the stage's schema and policy.
#[derive(Clone)]
pub struct SinkWriter {
    table: DeferredValue<QualifiedTableName>,
    schema: Arc<TableSchema>,
    policy: WritePolicy,
    sink: Arc<dyn TableSink>,
}

impl SinkWriter {
    pub fn new(
        table: DeferredValue<QualifiedTableName>,
        schema: Arc<TableSchema>,
        policy: WritePolicy,
        sink: Arc<dyn TableSink>,
    ) -> Self {
        Self {
            table,
            schema,
            policy,
            sink,
        }
    }

    pub fn table(&self) -> &DeferredValue<QualifiedTableName> {
        &self.table
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    pub fn check_available(&self) -> Result<()> {
        self.table.check_available()
    }

    /// Resolve the target table and load `rows` into it.
    pub async fn write(&self, rows: RowStream) -> Result<WriteOutcome> {
        let table = self.table.resolve().await?.clone();
        debug!(
            "Writing {} via {} sink ({:?}, {:?})",
            table,
            self.sink.name(),
            self.policy.create_disposition,
            self.policy.write_disposition
        );
        if self.policy.write_disposition == WriteDisposition::WriteAppend {
            warn!("{} is written in append mode; reruns will duplicate rows", table);
        }

        let request = WriteRequest {
            table,
            schema: self.schema.clone(),
            policy: self.policy.clone(),
        };
        let outcome = self.sink.write(request, rows).await?;
        info!(
            "Wrote {} rows to {}{}",
            outcome.rows_written,
            outcome.table,
            if outcome.created { " (created)" } else { "" }
        );
        Ok(outcome)
    }
}

impl fmt::Debug for SinkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkWriter")
            .field("table", &self.table)
            .field("fields", &self.schema.len())
            .field("policy", &self.policy)
            .field("sink", &self.sink.name())
            .finish()
    }
}
