//! Catalog-driven orchestrator: one read → write stage per catalog entry.

mod engine;

pub use engine::{ExecutionEngine, LocalEngine};

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::{JobConfig, SinkKind};
use crate::core::traits::{RowMapper, TableSink};
use crate::deferred::{DeferredValue, RuntimeParameters};
use crate::error::{ExtractError, Result};
use crate::secret::{maybe_decrypt, CloudKmsClient, KeyManagementClient, KeyReference};
use crate::sink::{
    MemoryWarehouse, PostgresWarehouse, QualifiedTableName, SinkWriter, WritePolicy,
};
use crate::source::{
    DataSourceConfig, DriverRegistry, DynamicReader, LabelRowMapper, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_FETCH_SIZE,
};

/// Builds execution graphs from catalogs.
///
/// Holds the job-level templates: the source configuration, the output
/// dataset and the write policy. Every stage receives its own clone of the
/// templates, so no memoized value (decrypted secrets included) is shared
/// between stages.
pub struct Orchestrator {
    source: DataSourceConfig,
    dataset: DeferredValue<String>,
    policy: WritePolicy,
    sink: Arc<dyn TableSink>,
    mapper: Arc<dyn RowMapper>,
    fetch_size: usize,
    channel_capacity: usize,
}

impl Orchestrator {
    pub fn new(
        source: DataSourceConfig,
        dataset: impl Into<DeferredValue<String>>,
        sink: Arc<dyn TableSink>,
    ) -> Self {
        Self {
            source,
            dataset: dataset.into(),
            policy: WritePolicy::full_refresh(),
            sink,
            mapper: Arc::new(LabelRowMapper::new()),
            fetch_size: DEFAULT_FETCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Build from a job configuration, with the Cloud KMS client and the
    /// sink it names.
    pub fn from_config(config: &JobConfig, params: &mut RuntimeParameters) -> Result<Self> {
        let token = config.kms.access_token_spec().to_deferred(params);
        let kms: Arc<dyn KeyManagementClient> =
            Arc::new(CloudKmsClient::new(config.kms.endpoint.clone(), token));

        let sink: Arc<dyn TableSink> = match config.target.sink {
            SinkKind::Memory => Arc::new(MemoryWarehouse::new()),
            SinkKind::Postgres => {
                let url = config.target.connection_url.as_ref().ok_or_else(|| {
                    ExtractError::Config(
                        "target.connection_url is required for the postgres sink".into(),
                    )
                })?;
                Arc::new(PostgresWarehouse::new(url.to_deferred(params)))
            }
        };

        Self::from_config_with(config, params, kms, sink)
    }

    /// Build from a job configuration with an explicit key-management client
    /// and sink.
    ///
    /// When `kms_encryption_key` is set, the connection URL, username and
    /// password are decrypted through `kms` on first resolution.
    pub fn from_config_with(
        config: &JobConfig,
        params: &mut RuntimeParameters,
        kms: Arc<dyn KeyManagementClient>,
        sink: Arc<dyn TableSink>,
    ) -> Result<Self> {
        config.validate()?;
        let key = config.kms_encryption_key.as_deref().and_then(KeyReference::new);
        match &key {
            Some(key) => info!("Source URL and credentials are decrypted with {}", key),
            None => debug!("No KMS key configured, source values are plaintext"),
        }

        let src = &config.source;
        let url = maybe_decrypt(src.connection_url.to_deferred(params), key.as_ref(), &kms);
        let mut source = DataSourceConfig::create(src.driver_class_name.to_deferred(params), url);
        if let Some(username) = &src.username {
            source = source.with_username(maybe_decrypt(
                username.to_deferred(params),
                key.as_ref(),
                &kms,
            ));
        }
        if let Some(password) = &src.password {
            source = source.with_password(maybe_decrypt(
                password.to_deferred(params),
                key.as_ref(),
                &kms,
            ));
        }
        if let Some(props) = &src.connection_properties {
            source = source.with_connection_properties(props.to_deferred(params));
        }

        let dataset = config.target.output_dataset.to_deferred(params);
        let policy = config
            .write
            .to_policy(config.target.staging_location.as_deref());

        Ok(Self::new(source, dataset, sink)
            .with_policy(policy)
            .with_fetch_size(config.execution.fetch_batch_size)
            .with_channel_capacity(config.execution.channel_capacity))
    }

    #[must_use]
    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn RowMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Resolve driver class names through `drivers`.
    #[must_use]
    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.source = self.source.with_drivers(drivers);
        self
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

    pub fn source(&self) -> &DataSourceConfig {
        &self.source
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    pub fn sink(&self) -> &Arc<dyn TableSink> {
        &self.sink
    }

    /// Build one stage per catalog entry.
    ///
    /// Fails before anything runs if the catalog is invalid, the static
    /// driver or URL is unusable, or a static dataset cannot be combined
    /// with an output table name.
    pub fn build(&self, catalog: &Catalog) -> Result<ExecutionGraph> {
        catalog.validate()?;
        self.source.validate_static()?;

        let mut stages = Vec::with_capacity(catalog.len());
        for entry in catalog {
            let name = entry.output_table_name.trim().to_string();
            if let Some(dataset) = self.dataset.peek() {
                QualifiedTableName::from_dataset(dataset, &name)?;
            }

            let reader = DynamicReader::new(
                self.source.clone(),
                entry.query.clone(),
                self.mapper.clone(),
            )
            .with_fetch_size(self.fetch_size)
            .with_channel_capacity(self.channel_capacity);

            let writer = SinkWriter::new(
                QualifiedTableName::deferred(self.dataset.clone(), name.as_str()),
                Arc::new(entry.table_schema.clone()),
                self.policy.clone(),
                self.sink.clone(),
            );

            debug!("Planned stage {} ({} fields)", name, entry.table_schema.len());
            stages.push(Stage {
                name,
                reader,
                writer,
            });
        }

        info!("Built execution graph with {} stages", stages.len());
        Ok(ExecutionGraph { stages })
    }

    /// Resolve the source configuration and open and close one connection.
    ///
    /// Works on a clone of the template, so nothing resolved here is kept.
    pub async fn check_connection(&self) -> Result<()> {
        let source = self.source.clone();
        source.check_available()?;
        let connection = source.open_connection().await?;
        connection.close().await;
        info!("Source connection OK");
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("source", &self.source)
            .field("dataset", &self.dataset)
            .field("policy", &self.policy)
            .field("sink", &self.sink.name())
            .finish()
    }
}

/// Independent stages sharing one run.
#[derive(Debug)]
pub struct ExecutionGraph {
    stages: Vec<Stage>,
}

impl ExecutionGraph {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }

    /// I/O-free check of every stage's deferred values.
    pub fn preflight(&self) -> Result<()> {
        for stage in &self.stages {
            stage.check_available()?;
        }
        Ok(())
    }

    /// Describe every stage without resolving anything.
    pub fn plan(&self) -> Vec<StagePlan> {
        self.stages.iter().map(Stage::plan).collect()
    }
}

/// One reader bound to one writer.
#[derive(Debug)]
pub struct Stage {
    name: String,
    reader: DynamicReader,
    writer: SinkWriter,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &DynamicReader {
        &self.reader
    }

    pub fn writer(&self) -> &SinkWriter {
        &self.writer
    }

    pub fn check_available(&self) -> Result<()> {
        self.reader
            .check_available()
            .and_then(|_| self.writer.check_available())
            .map_err(|e| e.in_stage(&self.name))
    }

    pub fn plan(&self) -> StagePlan {
        StagePlan {
            name: self.name.clone(),
            table: self
                .writer
                .table()
                .peek()
                .map(|t| t.to_string())
                .unwrap_or_else(|| self.writer.table().describe()),
            query: self.reader.query().to_string(),
            fields: self.writer.schema().field_names(),
        }
    }

    /// Stream the reader's rows into the writer.
    ///
    /// Cancelling `cancel` stops both sides; the source connection is
    /// released when the reader task ends.
    pub async fn run(self, cancel: CancellationToken) -> Result<StageReport> {
        let started = Instant::now();
        let rows = self.reader.read(cancel.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
            outcome = self.writer.write(rows) => outcome?,
        };

        Ok(StageReport {
            name: self.name,
            table: outcome.table.to_string(),
            rows_written: outcome.rows_written,
            created: outcome.created,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub name: String,
    /// Qualified table name, or a description of how it resolves.
    pub table: String,
    pub query: String,
    pub fields: Vec<String>,
}

/// Result of one completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub table: String,
    pub rows_written: u64,
    /// Whether the target table was created by this run.
    pub created: bool,
    pub duration_ms: u64,
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Per-stage results in catalog order.
    pub stages: Vec<StageReport>,

    /// Total rows written across all stages.
    pub rows_total: u64,
}

impl RunReport {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
