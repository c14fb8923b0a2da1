//! Core abstractions shared by readers, sinks and the orchestrator.
//!
//! - [`schema`]: target table schema descriptors
//! - [`value`]: typed values, native result rows and pipeline rows
//! - [`traits`]: driver, connection, row mapper and sink traits

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{FieldMode, FieldSchema, FieldType, TableSchema};
pub use traits::{
    Connection, ConnectionSpec, Driver, ResultStream, RowMapper, RowStream, TableSink,
};
pub use value::{ColumnMeta, ResultRow, TableRow, Value};
