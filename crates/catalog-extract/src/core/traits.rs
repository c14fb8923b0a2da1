//! Core traits at the seams between the extract engine and its collaborators.
//!
//! - [`Driver`] / [`Connection`]: open a source connection and run one query
//! - [`RowMapper`]: convert a native result row into a [`TableRow`]
//! - [`TableSink`]: create/replace a target table and load rows into it

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use secrecy::SecretString;

use crate::error::Result;
use crate::sink::{WriteOutcome, WriteRequest};

use super::value::{ResultRow, TableRow};

/// Stream of native rows produced by a [`Connection`] for one query.
pub type ResultStream<'a> = BoxStream<'a, Result<ResultRow>>;

/// Stream of mapped rows flowing from a reader into a sink.
pub type RowStream = BoxStream<'static, Result<TableRow>>;

/// Fully resolved connection descriptor handed to a [`Driver`].
///
/// Built from a data source configuration right before a connection is
/// opened and dropped with it.
pub struct ConnectionSpec {
    pub driver_class_name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub properties: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("driver_class_name", &self.driver_class_name)
            .field("url", &crate::source::redact_url(&self.url))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A source database driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// Whether this driver understands the URL scheme.
    fn accepts_url(&self, url: &str) -> bool;

    /// Open a physical connection.
    ///
    /// Network and authentication failures are `ConnectionFailed`.
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn Connection>>;
}

/// An open source connection.
#[async_trait]
pub trait Connection: Send {
    /// Execute `sql` and stream its rows in result order.
    ///
    /// `fetch_size` is a hint for how many rows to pull from the server per
    /// round trip. Failures, including mid-stream ones, are
    /// `QueryExecutionFailed`.
    async fn query<'a>(&'a mut self, sql: &str, fetch_size: usize) -> Result<ResultStream<'a>>;

    /// Close the connection. Dropping a connection also releases it.
    async fn close(self: Box<Self>);
}

/// Converts one native result row into the pipeline's row representation.
pub trait RowMapper: Send + Sync {
    fn map_row(&self, row: &ResultRow) -> Result<TableRow>;
}

impl<F> RowMapper for F
where
    F: Fn(&ResultRow) -> Result<TableRow> + Send + Sync,
{
    fn map_row(&self, row: &ResultRow) -> Result<TableRow> {
        self(row)
    }
}

/// A warehouse table store.
///
/// One call creates (if the policy allows) and loads one target table.
/// Implementations must apply the write atomically: a failed write leaves
/// the previous table contents in place.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Sink name for logging (e.g., "memory", "postgres").
    fn name(&self) -> &str;

    async fn write(&self, request: WriteRequest, rows: RowStream) -> Result<WriteOutcome>;
}
