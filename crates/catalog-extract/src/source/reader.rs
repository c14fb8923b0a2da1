//! Dynamic source reader: one connection, one query, one row stream.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::core::traits::{RowMapper, RowStream};
use crate::core::value::TableRow;
use crate::error::{ExtractError, Result};

use super::DataSourceConfig;

/// Default number of rows pulled from the source per round trip.
pub const DEFAULT_FETCH_SIZE: usize = 1000;

/// Default number of row batches buffered between the reader task and the sink.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Reads the rows of a single query through a [`DataSourceConfig`].
///
/// A reader is consumed by [`DynamicReader::read`]; re-reading needs a new
/// instance.
pub struct DynamicReader {
    config: DataSourceConfig,
    query: String,
    mapper: Arc<dyn RowMapper>,
    fetch_size: usize,
    channel_capacity: usize,
}

impl DynamicReader {
    pub fn new(config: DataSourceConfig, query: impl Into<String>, mapper: Arc<dyn RowMapper>) -> Self {
        Self {
            config,
            query: query.into(),
            mapper,
            fetch_size: DEFAULT_FETCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// I/O-free check that every deferred connection parameter is set.
    pub fn check_available(&self) -> Result<()> {
        self.config.check_available()
    }

    /// Start reading.
    ///
    /// A background task opens the connection, executes the query and sends
    /// mapped rows in result order. The connection is released when the
    /// result is exhausted, when the first error is reported, when `cancel`
    /// fires, or as soon as the returned stream is dropped, even while the
    /// source is between rows.
    pub fn read(self, cancel: CancellationToken) -> RowStream {
        let (tx, rx) = mpsc::channel::<Result<Vec<TableRow>>>(self.channel_capacity);

        tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ExtractError::Cancelled),
                    _ = tx.closed() => {
                        debug!("Row consumer went away, releasing connection");
                        return;
                    }
                    result = self.read_into(&tx) => result,
                };
                match outcome {
                    Ok(rows) => info!("Read {} rows", rows),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
            .in_current_span(),
        );

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|batch| (batch, rx)) })
            .flat_map(|batch| {
                let items: Vec<Result<TableRow>> = match batch {
                    Ok(rows) => rows.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    async fn read_into(&self, tx: &mpsc::Sender<Result<Vec<TableRow>>>) -> Result<u64> {
        let mut connection = self.config.open_connection().await?;
        let mut total = 0u64;
        {
            let mut rows = connection.query(&self.query, self.fetch_size).await?;
            let mut batch = Vec::with_capacity(self.fetch_size);

            while let Some(row) = rows.next().await {
                batch.push(self.mapper.map_row(&row?)?);
                if batch.len() >= self.fetch_size {
                    total += batch.len() as u64;
                    if tx.send(Ok(std::mem::take(&mut batch))).await.is_err() {
                        debug!("Row consumer went away, releasing connection");
                        return Ok(total);
                    }
                }
            }

            if !batch.is_empty() {
                total += batch.len() as u64;
                if tx.send(Ok(batch)).await.is_err() {
                    debug!("Row consumer went away, releasing connection");
                    return Ok(total);
                }
            }
        }
        connection.close().await;
        Ok(total)
    }
}

impl std::fmt::Debug for DynamicReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicReader")
            .field("config", &self.config)
            .field("query", &self.query)
            .field("fetch_size", &self.fetch_size)
            .finish()
    }
}
