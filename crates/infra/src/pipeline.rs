//! Pipeline Runner.
//!
//! Runs one step of a multi-step job per message and decides what happens
//! next. Ordering is enforced here and only here: step N+1 is enqueued after
//! step N has been released SUCCEEDED, never before. A message for step N+1
//! that arrives early anyway is acknowledged without leasing anything.
//!
//! An internal fault after acquisition releases the lease as FAILED
//! (`STEP_EXECUTION_FAILED`) before the error goes back to the transport.
//!
//! Redelivery of any message is safe. A SUCCEEDED step is never re-executed;
//! its message only re-drives the follow-up (enqueue next, or finalize).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use fleetroute_core::{
    Completion, Job, JobId, LeaseOutcome, StepName, StepOutcome, StepStatus, scaled_step_pct,
    step_completion_pct,
};

use crate::artifacts::ArtifactStore;
use crate::dispatch::{QueueDispatcher, TaskMessage};
use crate::executors::{Executor, ExecutorFailure, ExecutorRegistry, JobPlan, StepContext};
use crate::jobs::{JobRecords, RecordError, StepLeaseManager};
use crate::retry::RetryPolicy;
use crate::stats::EngineStats;
use crate::task_handler::{SkipReason, TaskError, TaskOutcome};

/// Error code recorded on a step released after an internal fault.
pub const STEP_EXECUTION_FAILED: &str = "STEP_EXECUTION_FAILED";

/// Unique lease owner for one delivery on this worker.
pub(crate) fn owner_token(worker_name: &str) -> String {
    format!("{worker_name}:{}", uuid::Uuid::now_v7().simple())
}

pub struct PipelineRunner {
    leases: Arc<StepLeaseManager>,
    dispatcher: Arc<dyn QueueDispatcher>,
    registry: Arc<ExecutorRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    stats: Arc<EngineStats>,
    attempts: RetryPolicy,
    worker_name: String,
    latency_warn: Duration,
}

impl PipelineRunner {
    pub fn new(
        leases: Arc<StepLeaseManager>,
        dispatcher: Arc<dyn QueueDispatcher>,
        registry: Arc<ExecutorRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            leases,
            dispatcher,
            registry,
            artifacts,
            stats,
            attempts: RetryPolicy::fixed(5, Duration::ZERO),
            worker_name: "worker".to_string(),
            latency_warn: Duration::from_secs(120),
        }
    }

    /// Retryable failures beyond this many attempts fail the job.
    pub fn with_max_step_attempts(mut self, max: u32) -> Self {
        self.attempts = RetryPolicy::fixed(max.max(1), Duration::ZERO);
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_latency_warning(mut self, threshold: Duration) -> Self {
        self.latency_warn = threshold;
        self
    }

    fn records(&self) -> &Arc<JobRecords> {
        self.leases.records()
    }

    /// Run `step` of `job_id` once.
    #[instrument(skip(self), fields(job_id = %job_id, step = %step))]
    pub async fn run_step(&self, job_id: &JobId, step: StepName) -> Result<TaskOutcome, TaskError> {
        let job = self.records().get(job_id).await?;
        if job.is_terminal() {
            return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
        }
        let Some(JobPlan::Pipeline(definition)) = self.registry.plan(job.job_type) else {
            return Ok(self.malformed(job_id, format!("{} has no step pipeline", job.job_type)));
        };
        let Some(executor) = definition.executor(step).cloned() else {
            return Ok(self.malformed(job_id, format!("no executor for step {step}")));
        };

        if let Some(pending) = unfinished_predecessor(&job, step) {
            debug!(pending = %pending, "earlier step not finished; the chain will deliver this step");
            return Ok(TaskOutcome::skipped(SkipReason::PredecessorPending));
        }

        let owner = owner_token(&self.worker_name);
        let outcome = match self
            .leases
            .acquire(job_id, step, &owner, self.leases.lease_seconds())
            .await
        {
            Ok(outcome) => outcome,
            Err(RecordError::Domain(e)) => return Ok(self.malformed(job_id, e.to_string())),
            Err(e) => return Err(e.into()),
        };
        let lease = match outcome {
            LeaseOutcome::Granted(lease) | LeaseOutcome::StaleReclaimed { lease, .. } => lease,
            LeaseOutcome::Denied { .. } => return Ok(TaskOutcome::skipped(SkipReason::LeaseHeld)),
            LeaseOutcome::Closed(_) => return Ok(TaskOutcome::skipped(SkipReason::JobClosed)),
            LeaseOutcome::AlreadyComplete => {
                debug!("step already succeeded; re-driving follow-up");
                return self.advance(job_id, step).await;
            }
        };
        self.stats.step_started();

        let result = self.run_leased(job_id, step, &owner, lease.attempt, executor).await;
        if let Err(e) = &result {
            self.abandon(job_id, step, &owner, e).await;
        }
        result
    }

    async fn run_leased(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        attempt: u32,
        executor: Arc<dyn Executor>,
    ) -> Result<TaskOutcome, TaskError> {
        // Re-read: acquisition moved the job to RUNNING and may follow other
        // steps' merges that happened since the first read.
        let job = self.records().get(job_id).await?;
        let (index, total) = position(&job, step);
        self.records()
            .update_progress(job_id, scaled_step_pct(index, total, 0), Some(&format!("Running {step}")))
            .await?;

        let ctx = StepContext::new(
            job_id.clone(),
            job.job_type,
            Some(step),
            attempt,
            job.payload.clone(),
            job.result_ref.clone(),
            self.artifacts.clone(),
        )
        .with_progress(self.leases.clone(), owner, index, total);

        let result = executor.execute(&ctx).await;

        if !self.leases.holds(job_id, step, owner).await? {
            debug!(owner = %owner, "lease lost while executing; discarding result");
            return Ok(TaskOutcome::skipped(SkipReason::LeaseLost));
        }

        match result {
            Ok(output) => {
                let outcome = StepOutcome::success(output);
                if let Some(skip) = self.record(job_id, step, owner, &outcome).await? {
                    return Ok(skip);
                }
                self.stats.step_succeeded();
                self.records()
                    .update_progress(
                        job_id,
                        step_completion_pct(index, total),
                        Some(&format!("{step} complete")),
                    )
                    .await?;
                self.advance(job_id, step).await
            }
            Err(failure) => self.fail_step(job_id, step, owner, attempt, failure).await,
        }
    }

    /// Release a still-held lease as FAILED after an internal fault, so the
    /// redelivery of this message can lease the step again.
    async fn abandon(&self, job_id: &JobId, step: StepName, owner: &str, cause: &TaskError) {
        let outcome = StepOutcome::failure(STEP_EXECUTION_FAILED, cause.to_string());
        match self.leases.release(job_id, step, owner, &outcome).await {
            Ok(_) => warn!(
                event = "pipeline.step_abandoned",
                job_id = %job_id,
                step = %step,
                error = %cause,
                "released step after internal fault"
            ),
            Err(e) if e.is_lock_not_held() || e.is_closed() => {}
            Err(e) => error!(
                job_id = %job_id,
                step = %step,
                error = %e,
                "could not release step after internal fault; waiting for lease expiry"
            ),
        }
    }

    /// Merge then release. `Some(skip)` when the lease or the job went away.
    async fn record(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        outcome: &StepOutcome,
    ) -> Result<Option<TaskOutcome>, TaskError> {
        let merged = match self.records().merge_step_result(job_id, step, owner, outcome).await {
            Ok(_) => self.leases.release(job_id, step, owner, outcome).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match merged {
            Ok(()) => Ok(None),
            Err(e) if e.is_lock_not_held() => {
                debug!(job_id = %job_id, step = %step, owner, "lease lost before merge; result ignored");
                Ok(Some(TaskOutcome::skipped(SkipReason::LeaseLost)))
            }
            Err(e) if e.is_closed() => Ok(Some(TaskOutcome::skipped(SkipReason::JobClosed))),
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_step(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        attempt: u32,
        failure: ExecutorFailure,
    ) -> Result<TaskOutcome, TaskError> {
        self.stats.step_failed();
        let outcome = StepOutcome::failure(&failure.code, &failure.detail);
        if let Some(skip) = self.record(job_id, step, owner, &outcome).await? {
            return Ok(skip);
        }
        warn!(
            event = "pipeline.step_failed",
            job_id = %job_id,
            step = %step,
            attempt,
            retryable = failure.retryable,
            code = %failure.code,
            detail = %failure.detail,
            "step failed"
        );

        if failure.retryable && self.attempts.should_retry(attempt) {
            return Ok(TaskOutcome::Retry {
                reason: format!("{step} attempt {attempt} failed: {}", failure.code),
            });
        }

        let finalized = match self
            .records()
            .finalize(job_id, Completion::failed(failure.code.clone(), failure.detail.clone()))
            .await
        {
            Ok(finalized) => finalized,
            Err(RecordError::Domain(e)) => {
                debug!(job_id = %job_id, error = %e, "job closed before failure could be recorded");
                return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
            }
            Err(e) => return Err(e.into()),
        };
        if finalized.changed {
            self.stats.job_failed();
            info!(job_id = %job_id, step = %step, code = %failure.code, "job failed");
        }
        Ok(TaskOutcome::Completed)
    }

    /// Follow-up once `step` is SUCCEEDED: enqueue the next step or finalize.
    async fn advance(&self, job_id: &JobId, step: StepName) -> Result<TaskOutcome, TaskError> {
        let job = self.records().get(job_id).await?;
        if job.is_terminal() {
            return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
        }

        let Some(next) = job.next_step(step) else {
            return self.complete(job).await;
        };
        if job.step(next).map(|s| s.status) != Some(StepStatus::Pending) {
            debug!(job_id = %job_id, next = %next, "next step already started; not enqueuing");
            return Ok(TaskOutcome::Completed);
        }

        if let Err(e) = self
            .dispatcher
            .enqueue(TaskMessage::pipeline_step(job_id, next))
            .await
        {
            self.stats.enqueue_failed();
            error!(
                event = "dispatch.enqueue_failed",
                job_id = %job_id,
                step = %next,
                code = e.code(),
                error = %e,
                "failed to enqueue next step"
            );
            return Err(e.into());
        }
        Ok(TaskOutcome::Completed)
    }

    async fn complete(&self, job: Job) -> Result<TaskOutcome, TaskError> {
        if let Some(unfinished) = job.first_unfinished_step() {
            // Last step done but an earlier one is not: a stray message for
            // the last step. The chain will come back through here.
            warn!(job_id = %job.id, step = %unfinished, "last step finished before earlier steps");
            return Ok(TaskOutcome::Completed);
        }

        let finalized = match self
            .records()
            .finalize(&job.id, Completion::Succeeded { result: json!({}) })
            .await
        {
            Ok(finalized) => finalized,
            Err(RecordError::Domain(e)) => {
                debug!(job_id = %job.id, error = %e, "job closed concurrently");
                return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
            }
            Err(e) => return Err(e.into()),
        };
        if finalized.changed {
            self.stats.job_succeeded();
            let latency = (finalized.job.updated_at - finalized.job.created_at)
                .to_std()
                .unwrap_or_default();
            info!(
                event = "pipeline.complete",
                job_id = %job.id,
                job_type = %job.job_type,
                latency_ms = latency.as_millis() as u64,
                "pipeline complete"
            );
            if latency > self.latency_warn {
                warn!(
                    event = "pipeline.latency_slow",
                    job_id = %job.id,
                    latency_ms = latency.as_millis() as u64,
                    threshold_ms = self.latency_warn.as_millis() as u64,
                    "pipeline slower than threshold"
                );
            }
        }
        Ok(TaskOutcome::Completed)
    }

    fn malformed(&self, job_id: &JobId, reason: String) -> TaskOutcome {
        self.stats.message_dropped();
        warn!(job_id = %job_id, reason = %reason, "dropping malformed pipeline task");
        TaskOutcome::skipped(SkipReason::Malformed)
    }
}

/// First step before `step` that has not succeeded.
fn unfinished_predecessor(job: &Job, step: StepName) -> Option<StepName> {
    let index = job.step_index(step)?;
    job.steps[..index]
        .iter()
        .find(|s| s.status != StepStatus::Succeeded)
        .map(|s| s.name)
}

fn position(job: &Job, step: StepName) -> (usize, usize) {
    (job.step_index(step).unwrap_or(0), job.steps.len())
}
