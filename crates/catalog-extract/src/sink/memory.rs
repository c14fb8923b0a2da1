//! In-process table store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::debug;

use crate::core::schema::TableSchema;
use crate::core::traits::{RowStream, TableSink};
use crate::core::value::TableRow;
use crate::error::{ExtractError, Result};

use super::{CreateDisposition, QualifiedTableName, WriteDisposition, WriteOutcome, WriteRequest};

#[derive(Debug, Clone)]
struct StoredTable {
    schema: TableSchema,
    rows: Vec<TableRow>,
}

/// A warehouse held in memory.
///
/// Rows are collected and conformed before the table is touched, so a
/// failed write leaves the previous contents unchanged. A full refresh
/// replaces the stored schema along with the rows; appends require the
/// schemas to match. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    tables: Arc<Mutex<HashMap<String, StoredTable>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredTable>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace a table with the given contents.
    pub fn seed(&self, table: &QualifiedTableName, schema: TableSchema, rows: Vec<TableRow>) {
        self.lock()
            .insert(table.to_string(), StoredTable { schema, rows });
    }

    /// Current contents of a table, or `None` if it does not exist.
    pub fn rows(&self, table: &QualifiedTableName) -> Option<Vec<TableRow>> {
        self.lock().get(&table.to_string()).map(|t| t.rows.clone())
    }

    pub fn schema(&self, table: &QualifiedTableName) -> Option<TableSchema> {
        self.lock().get(&table.to_string()).map(|t| t.schema.clone())
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TableSink for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, request: WriteRequest, rows: RowStream) -> Result<WriteOutcome> {
        let key = request.table.to_string();
        if let Some(location) = &request.policy.staging_location {
            debug!("Memory sink loads {} directly, ignoring staging location {}", key, location);
        }

        let exists = self.lock().contains_key(&key);
        if !exists && request.policy.create_disposition == CreateDisposition::CreateNever {
            return Err(ExtractError::write(
                &key,
                "table does not exist and create disposition is create_never",
            ));
        }

        let conformed: Vec<TableRow> = rows
            .and_then(|row| futures::future::ready(request.conform(&row)))
            .try_collect()
            .await?;
        let rows_written = conformed.len() as u64;

        let mut tables = self.lock();
        let created = !tables.contains_key(&key);
        if created && request.policy.create_disposition == CreateDisposition::CreateNever {
            return Err(ExtractError::write(&key, "table was dropped during the write"));
        }
        let stored = tables.entry(key.clone()).or_insert_with(|| StoredTable {
            schema: (*request.schema).clone(),
            rows: Vec::new(),
        });

        if request.policy.write_disposition != WriteDisposition::WriteTruncate
            && stored.schema != *request.schema
        {
            return Err(ExtractError::write(
                &key,
                "existing table schema differs from the catalog schema",
            ));
        }

        match request.policy.write_disposition {
            WriteDisposition::WriteTruncate => {
                stored.schema = (*request.schema).clone();
                stored.rows = conformed;
            }
            WriteDisposition::WriteAppend => stored.rows.extend(conformed),
            WriteDisposition::WriteEmpty => {
                if !stored.rows.is_empty() {
                    return Err(ExtractError::write(
                        &key,
                        "table is not empty and write disposition is write_empty",
                    ));
                }
                stored.rows = conformed;
            }
        }

        Ok(WriteOutcome {
            table: request.table,
            rows_written,
            created,
        })
    }
}
