//! # catalog-extract
//!
//! Catalog-driven extracts from a relational source into warehouse tables.
//!
//! A catalog lists extract definitions (a query, an output table name and a
//! table schema). For each entry the orchestrator builds one independent
//! stage that reads the query's rows and loads them into the output table.
//! Connection parameters are deferred values:
//!
//! - **Deferred values** resolved lazily, at most once per instance
//! - **Runtime parameters** declared at definition time, bound at run time
//! - **Encrypted values** decrypted through a key-management service on
//!   first use, chosen at construction time
//! - **Full refresh** writes: create if needed, truncate and load
//!
//! ## Example
//!
//! ```rust,no_run
//! use catalog_extract::{Catalog, ExecutionEngine, JobConfig, LocalEngine, Orchestrator, RuntimeParameters};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = JobConfig::load("job.yaml")?;
//!     let catalog = Catalog::load(&config.catalog)?;
//!
//!     let mut params = RuntimeParameters::new();
//!     let orchestrator = Orchestrator::from_config(&config, &mut params)?;
//!     let graph = orchestrator.build(&catalog)?;
//!     params.bind("db_password", "s3cret")?;
//!
//!     let report = LocalEngine::new().execute(graph, CancellationToken::new()).await?;
//!     println!("Wrote {} rows", report.rows_total);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod core;
pub mod deferred;
pub mod error;
pub mod orchestrator;
pub mod secret;
pub mod sink;
pub mod source;

// Re-exports for convenient access
pub use catalog::{Catalog, CatalogIssue, ExtractDefinition};
pub use config::{JobConfig, ParameterSpec, SinkKind};
pub use crate::core::{
    Connection, ConnectionSpec, Driver, FieldMode, FieldSchema, FieldType, ResultRow, RowMapper,
    TableRow, TableSchema, TableSink, Value,
};
pub use deferred::{DeferredValue, RuntimeParameters, ValueSource};
pub use error::{ErrorKind, ExtractError, Result};
pub use orchestrator::{
    ExecutionEngine, ExecutionGraph, LocalEngine, Orchestrator, RunReport, Stage, StagePlan,
    StageReport,
};
pub use secret::{maybe_decrypt, CloudKmsClient, KeyManagementClient, KeyReference};
pub use sink::{
    CreateDisposition, MemoryWarehouse, PostgresWarehouse, QualifiedTableName, SinkWriter,
    WriteDisposition, WritePolicy,
};
pub use source::{DataSourceConfig, DriverRegistry, DynamicReader, LabelRowMapper, PostgresDriver};
