//! Execution engines for [`ExecutionGraph`]s.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::{ExecutionGraph, RunReport, Stage, StageReport};
use crate::error::{ExtractError, Result};

/// Runs a finished execution graph.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run every stage of `graph`.
    ///
    /// The run fails as a whole if any stage fails. Cancelling `cancel`
    /// stops every stage and yields [`ExtractError::Cancelled`].
    async fn execute(&self, graph: ExecutionGraph, cancel: CancellationToken) -> Result<RunReport>;
}

/// Runs stages as tokio tasks in this process.
///
/// Stages have no relative order. At most `max_concurrent` run at once
/// (all of them when unset). The first stage failure cancels the others.
#[derive(Debug, Clone, Default)]
pub struct LocalEngine {
    max_concurrent: Option<usize>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: Option<usize>) -> Self {
        self.max_concurrent = max_concurrent.map(|n| n.max(1));
        self
    }
}

async fn run_stage(
    stage: Stage,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Result<StageReport> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
        permit = semaphore.acquire_owned() => permit.map_err(|_| ExtractError::Cancelled)?,
    };
    info!("Starting stage");
    let report = stage.run(cancel).await?;
    info!(
        "Stage complete: {} rows in {} ms",
        report.rows_written, report.duration_ms
    );
    Ok(report)
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    async fn execute(&self, graph: ExecutionGraph, cancel: CancellationToken) -> Result<RunReport> {
        graph.preflight()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let stage_count = graph.len();
        let limit = self.max_concurrent.unwrap_or(stage_count).max(1);
        info!(
            "Starting run {}: {} stages, up to {} at once",
            run_id, stage_count, limit
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let run_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (index, stage) in graph.into_stages().into_iter().enumerate() {
            let name = stage.name().to_string();
            let span = info_span!("stage", table = %name);
            let semaphore = semaphore.clone();
            let stage_cancel = run_cancel.clone();
            tasks.spawn(
                async move {
                    let result = run_stage(stage, semaphore, stage_cancel).await;
                    (index, name, result)
                }
                .instrument(span),
            );
        }

        let mut reports: Vec<Option<StageReport>> = vec![None; stage_count];
        let mut failure: Option<ExtractError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(report))) => reports[index] = Some(report),
                Ok((_, name, Err(e))) => {
                    if failure.is_none() && !cancel.is_cancelled() {
                        error!("Stage {} failed: {}", name, e);
                        failure = Some(e.in_stage(name));
                        run_cancel.cancel();
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        error!("Stage task failed: {}", e);
                        failure = Some(ExtractError::Internal(format!("stage task failed: {}", e)));
                        run_cancel.cancel();
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            info!("Run {} cancelled", run_id);
            return Err(ExtractError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let stages: Vec<StageReport> = reports.into_iter().flatten().collect();
        let rows_total = stages.iter().map(|s| s.rows_written).sum();
        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            stages,
            rows_total,
        };
        info!(
            "Run {} complete: {} stages, {} rows in {:.1}s",
            report.run_id,
            report.stages.len(),
            report.rows_total,
            report.duration_seconds()
        );
        Ok(report)
    }
}
