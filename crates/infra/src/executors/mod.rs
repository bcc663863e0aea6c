//! Step and job executors.
//!
//! Executors do the actual work (geocoding, matrix builds, the solver,
//! exports, ML). The engine treats them as opaque: JSON in, JSON out or an
//! [`ExecutorFailure`]. They are registered per [`JobType`] at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use fleetroute_core::{DomainError, DomainResult, JobId, JobType, MIN_LEASE_SECONDS, StepName, scaled_step_pct};

use crate::artifacts::ArtifactStore;
use crate::jobs::StepLeaseManager;

pub mod http;

pub use http::{HttpExecutor, http_registry};

/// Why an executor gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct ExecutorFailure {
    pub code: String,
    pub detail: String,
    /// Transient failures are retried through queue redelivery.
    pub retryable: bool,
}

impl ExecutorFailure {
    pub fn retryable(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ExecutorFailure>;
}

/// Where progress reports go while an executor runs.
#[derive(Clone)]
struct ProgressSink {
    leases: Arc<StepLeaseManager>,
    owner: String,
    index: usize,
    total: usize,
}

/// Everything an executor gets to see.
pub struct StepContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// `None` for single-shot jobs.
    pub step: Option<StepName>,
    /// 1-based attempt number of this lease.
    pub attempt: u32,
    pub payload: Value,
    /// Merged outputs of earlier steps.
    pub accumulated: Value,
    artifacts: Arc<dyn ArtifactStore>,
    progress: Option<ProgressSink>,
}

impl StepContext {
    pub fn new(
        job_id: JobId,
        job_type: JobType,
        step: Option<StepName>,
        attempt: u32,
        payload: Value,
        accumulated: Value,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            step,
            attempt,
            payload,
            accumulated,
            artifacts,
            progress: None,
        }
    }

    /// Route progress reports into `index`'s slice of a `total`-step bar and
    /// use them to extend `owner`'s lease.
    pub(crate) fn with_progress(
        mut self,
        leases: Arc<StepLeaseManager>,
        owner: impl Into<String>,
        index: usize,
        total: usize,
    ) -> Self {
        self.progress = Some(ProgressSink {
            leases,
            owner: owner.into(),
            index,
            total,
        });
        self
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Artifact key for `name` scoped to this job.
    pub fn artifact_key(&self, name: &str) -> String {
        format!("{}/{}", self.job_id, name)
    }

    /// Report 0–100 progress within the current step and extend the lease.
    ///
    /// Returns `false` once the lease is gone; the executor should stop, as
    /// its result will be discarded.
    pub async fn report_progress(&self, inner_pct: i64, message: &str) -> bool {
        let Some(sink) = &self.progress else {
            return true;
        };
        let held = self.heartbeat().await;
        if held {
            let pct = scaled_step_pct(sink.index, sink.total, inner_pct);
            if let Err(e) = sink
                .leases
                .records()
                .update_progress(&self.job_id, pct, Some(message))
                .await
            {
                warn!(job_id = %self.job_id, error = %e, "progress update failed");
            }
        }
        held
    }

    /// Extend the lease without reporting progress.
    pub async fn heartbeat(&self) -> bool {
        let Some(sink) = &self.progress else {
            return true;
        };
        let touched = match self.step {
            Some(step) => sink.leases.touch(&self.job_id, step, &sink.owner).await,
            None => sink.leases.touch_claim(&self.job_id, &sink.owner).await,
        };
        touched.unwrap_or_else(|e| {
            warn!(job_id = %self.job_id, error = %e, "lease touch failed");
            false
        })
    }

    /// A third of the lease: two heartbeats can go missing before it lapses.
    pub fn heartbeat_interval(&self) -> Duration {
        let lease = self
            .progress
            .as_ref()
            .map_or(MIN_LEASE_SECONDS, |sink| sink.leases.lease_seconds().max(MIN_LEASE_SECONDS));
        Duration::from_secs((lease / 3).max(1) as u64)
    }

    /// Drive `work` to completion, extending the lease every `every` while
    /// it runs.
    pub async fn with_heartbeat<F: Future>(&self, every: Duration, work: F) -> F::Output {
        if self.progress.is_none() {
            return work.await;
        }
        let every = every.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if !self.heartbeat().await {
                        debug!(job_id = %self.job_id, "lease gone while executor still running");
                    }
                }
            }
        }
    }
}

/// Ordered step chain with an executor per step.
#[derive(Clone)]
pub struct PipelineDefinition {
    steps: Vec<(StepName, Arc<dyn Executor>)>,
}

impl PipelineDefinition {
    pub fn new(steps: Vec<(StepName, Arc<dyn Executor>)>) -> DomainResult<Self> {
        if steps.is_empty() {
            return Err(DomainError::validation("pipeline needs at least one step"));
        }
        for (i, (name, _)) in steps.iter().enumerate() {
            if steps[..i].iter().any(|(other, _)| other == name) {
                return Err(DomainError::validation(format!("duplicate step {name} in pipeline")));
            }
        }
        Ok(Self { steps })
    }

    pub fn chain(&self) -> Vec<StepName> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    pub fn executor(&self, step: StepName) -> Option<&Arc<dyn Executor>> {
        self.steps.iter().find(|(name, _)| *name == step).map(|(_, e)| e)
    }
}

#[derive(Clone)]
pub enum JobPlan {
    Pipeline(PipelineDefinition),
    Single(Arc<dyn Executor>),
}

/// Executors keyed by job type, fixed after startup.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    plans: HashMap<JobType, JobPlan>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, job_type: JobType, definition: PipelineDefinition) -> Self {
        self.plans.insert(job_type, JobPlan::Pipeline(definition));
        self
    }

    pub fn with_single(mut self, job_type: JobType, executor: Arc<dyn Executor>) -> Self {
        self.plans.insert(job_type, JobPlan::Single(executor));
        self
    }

    pub fn plan(&self, job_type: JobType) -> Option<&JobPlan> {
        self.plans.get(&job_type)
    }

    /// Step chain a new job of `job_type` starts with (empty for single-shot).
    pub fn chain(&self, job_type: JobType) -> Option<Vec<StepName>> {
        match self.plans.get(&job_type)? {
            JobPlan::Pipeline(def) => Some(def.chain()),
            JobPlan::Single(_) => Some(Vec::new()),
        }
    }

    pub fn supports(&self, job_type: JobType) -> bool {
        self.plans.contains_key(&job_type)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        async fn execute(&self, ctx: &StepContext) -> Result<Value, ExecutorFailure> {
            Ok(json!({ "echo": ctx.payload.clone() }))
        }
    }

    #[test]
    fn pipeline_rejects_duplicates_and_empty_chains() {
        let echo: Arc<dyn Executor> = Arc::new(Echo);
        assert!(PipelineDefinition::new(vec![]).is_err());
        assert!(
            PipelineDefinition::new(vec![
                (StepName::Geocode, echo.clone()),
                (StepName::Geocode, echo.clone()),
            ])
            .is_err()
        );
        let def = PipelineDefinition::new(vec![
            (StepName::Geocode, echo.clone()),
            (StepName::Optimize, echo),
        ])
        .unwrap();
        assert_eq!(def.chain(), vec![StepName::Geocode, StepName::Optimize]);
        assert!(def.executor(StepName::BuildMatrix).is_none());
    }

    #[test]
    fn registry_reports_chains() {
        let echo: Arc<dyn Executor> = Arc::new(Echo);
        let registry = ExecutorRegistry::new()
            .with_single(JobType::ExportPdf, echo.clone())
            .with_pipeline(
                JobType::OptimizePipeline,
                PipelineDefinition::new(vec![(StepName::Geocode, echo)]).unwrap(),
            );

        assert_eq!(registry.chain(JobType::ExportPdf), Some(vec![]));
        assert_eq!(registry.chain(JobType::OptimizePipeline), Some(vec![StepName::Geocode]));
        assert_eq!(registry.chain(JobType::MlTrain), None);
        assert!(!registry.supports(JobType::MlTrain));
    }
}
