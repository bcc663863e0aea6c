//! Task Handler: the single inbound entrypoint for queue deliveries.
//!
//! Every transport (push HTTP endpoint, pull worker, inline dispatcher)
//! funnels messages through [`TaskHandler::handle`]. The returned
//! [`TaskOutcome`] tells the transport whether to acknowledge:
//!
//! | Result | Push (`/tasks/handle`) | Pull worker | Inline |
//! |--------|------------------------|-------------|--------|
//! | `Completed`, `Skipped` | 200 | XACK | done |
//! | `Skipped { lease_held }` | 200 | left pending | done |
//! | `Retry` | 503 | left pending | redelivered |
//! | `Err(TaskError)` | 500 | left pending | redelivered |

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use fleetroute_core::{Completion, Job, JobId, LeaseOutcome, StepName, StepOutcome};

use crate::artifacts::ArtifactStore;
use crate::dispatch::{EnqueueError, TaskKind, TaskMessage};
use crate::executors::{Executor, ExecutorRegistry, JobPlan, StepContext};
use crate::jobs::{RecordError, StepLeaseManager};
use crate::pipeline::{PipelineRunner, STEP_EXECUTION_FAILED, owner_token};
use crate::retry::RetryPolicy;
use crate::stats::EngineStats;

/// Why a delivery was acknowledged without doing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    JobClosed,
    LeaseHeld,
    LeaseLost,
    Malformed,
    /// A step arrived before the steps ahead of it succeeded.
    PredecessorPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Skipped { reason: SkipReason },
    /// Ask the transport to redeliver later.
    Retry { reason: String },
}

impl TaskOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        TaskOutcome::Skipped { reason }
    }

    /// Whether the transport should acknowledge the message.
    pub fn is_ack(&self) -> bool {
        !matches!(self, TaskOutcome::Retry { .. })
    }

    /// Whether a pull-queue entry may be acknowledged.
    ///
    /// Stricter than [`is_ack`](Self::is_ack): a `LeaseHeld` entry stays
    /// pending, since the holder may have died and the pending entry is the
    /// only thing that brings the step back once that lease expires.
    pub fn settles_pull_entry(&self) -> bool {
        self.is_ack() && *self != TaskOutcome::skipped(SkipReason::LeaseHeld)
    }
}

/// Infrastructure fault; the message must be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

pub struct TaskHandler {
    runner: Arc<PipelineRunner>,
    leases: Arc<StepLeaseManager>,
    registry: Arc<ExecutorRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    stats: Arc<EngineStats>,
    attempts: RetryPolicy,
    worker_name: String,
}

impl TaskHandler {
    pub fn new(
        runner: Arc<PipelineRunner>,
        leases: Arc<StepLeaseManager>,
        registry: Arc<ExecutorRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            runner,
            leases,
            registry,
            artifacts,
            stats,
            attempts: RetryPolicy::fixed(5, Duration::ZERO),
            worker_name: "worker".to_string(),
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.attempts = RetryPolicy::fixed(max.max(1), Duration::ZERO);
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    #[instrument(skip(self, message), fields(task = %message))]
    pub async fn handle(&self, message: &TaskMessage) -> Result<TaskOutcome, TaskError> {
        let job_id = match message.job_id.trim().parse::<JobId>() {
            Ok(id) => id,
            Err(e) => return Ok(self.drop_message(message, e.to_string())),
        };
        let job = match self.leases.records().get(&job_id).await {
            Ok(job) => job,
            Err(RecordError::NotFound(_)) => return Ok(self.drop_message(message, "job not found".to_string())),
            Err(e) => return Err(e.into()),
        };
        if job.is_terminal() {
            debug!(status = %job.status, "job is terminal; acknowledging");
            return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
        }

        match message.kind {
            TaskKind::PipelineStep => {
                if !job.is_pipeline() {
                    return Ok(self.drop_message(message, format!("{} is not a pipeline job", job.job_type)));
                }
                let step = match message.step.as_deref() {
                    Some(raw) => match raw.parse::<StepName>() {
                        Ok(step) => step,
                        Err(e) => return Ok(self.drop_message(message, e.to_string())),
                    },
                    // No step given: resume where the job stands.
                    None => match job
                        .first_unfinished_step()
                        .or_else(|| job.steps.last().map(|s| s.name))
                    {
                        Some(step) => step,
                        None => return Ok(self.drop_message(message, "job has no steps".to_string())),
                    },
                };
                if job.step(step).is_none() {
                    return Ok(self.drop_message(message, format!("step {step} is not in the job's chain")));
                }
                self.runner.run_step(&job_id, step).await
            }
            TaskKind::GenericJob => {
                if job.is_pipeline() {
                    return Ok(self.drop_message(message, format!("{} runs as a pipeline", job.job_type)));
                }
                self.run_generic_job(&job_id).await
            }
        }
    }

    /// Run a single-shot job under its whole-job claim.
    async fn run_generic_job(&self, job_id: &JobId) -> Result<TaskOutcome, TaskError> {
        let records = self.leases.records();
        let job = records.get(job_id).await?;

        let executor = match self.registry.plan(job.job_type) {
            Some(JobPlan::Single(executor)) => executor.clone(),
            _ => {
                let finalized = records
                    .finalize(
                        job_id,
                        Completion::failed(
                            "JOB_TYPE_UNSUPPORTED",
                            format!("no executor registered for {}", job.job_type),
                        ),
                    )
                    .await?;
                if finalized.changed {
                    self.stats.job_failed();
                }
                return Ok(TaskOutcome::Completed);
            }
        };

        let owner = owner_token(&self.worker_name);
        let lease = match self
            .leases
            .acquire_claim(job_id, &owner, self.leases.lease_seconds())
            .await?
        {
            LeaseOutcome::Granted(lease) | LeaseOutcome::StaleReclaimed { lease, .. } => lease,
            LeaseOutcome::Denied { .. } => return Ok(TaskOutcome::skipped(SkipReason::LeaseHeld)),
            LeaseOutcome::Closed(_) | LeaseOutcome::AlreadyComplete => {
                return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
            }
        };
        self.stats.step_started();

        let result = self.run_claimed(&job, &owner, lease.attempt, executor).await;
        if let Err(e) = &result {
            let outcome = StepOutcome::failure(STEP_EXECUTION_FAILED, e.to_string());
            match self.leases.release_claim(job_id, &owner, &outcome).await {
                Ok(_) => warn!(job_id = %job_id, error = %e, "released claim after internal fault"),
                Err(release) if release.is_lock_not_held() || release.is_closed() => {}
                Err(release) => warn!(
                    job_id = %job_id,
                    error = %release,
                    "could not release claim after internal fault; waiting for expiry"
                ),
            }
        }
        result
    }

    async fn run_claimed(
        &self,
        job: &Job,
        owner: &str,
        attempt: u32,
        executor: Arc<dyn Executor>,
    ) -> Result<TaskOutcome, TaskError> {
        let records = self.leases.records();
        let job_id = &job.id;
        records
            .update_progress(job_id, 1, Some(&format!("Running {}", job.job_type)))
            .await?;

        let ctx = StepContext::new(
            job_id.clone(),
            job.job_type,
            None,
            attempt,
            job.payload.clone(),
            job.result_ref.clone(),
            self.artifacts.clone(),
        )
        .with_progress(self.leases.clone(), owner, 0, 1);

        let result = executor.execute(&ctx).await;
        if !self.leases.holds_claim(job_id, owner).await? {
            debug!(owner = %owner, "claim lost while executing; discarding result");
            return Ok(TaskOutcome::skipped(SkipReason::LeaseLost));
        }

        let completion = match result {
            Ok(output) => {
                self.stats.step_succeeded();
                Completion::Succeeded { result: output }
            }
            Err(failure) => {
                self.stats.step_failed();
                let outcome = StepOutcome::failure(&failure.code, &failure.detail);
                match self.leases.release_claim(job_id, owner, &outcome).await {
                    Ok(_) => {}
                    Err(e) if e.is_lock_not_held() => return Ok(TaskOutcome::skipped(SkipReason::LeaseLost)),
                    Err(e) if e.is_closed() => return Ok(TaskOutcome::skipped(SkipReason::JobClosed)),
                    Err(e) => return Err(e.into()),
                }
                warn!(
                    event = "pipeline.step_failed",
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempt,
                    retryable = failure.retryable,
                    code = %failure.code,
                    "job executor failed"
                );
                if failure.retryable && self.attempts.should_retry(attempt) {
                    return Ok(TaskOutcome::Retry {
                        reason: format!("{} attempt {} failed: {}", job.job_type, attempt, failure.code),
                    });
                }
                Completion::failed(failure.code, failure.detail)
            }
        };

        let succeeded = matches!(completion, Completion::Succeeded { .. });
        let finalized = match records.finalize(job_id, completion).await {
            Ok(finalized) => finalized,
            Err(RecordError::Domain(e)) => {
                debug!(job_id = %job_id, error = %e, "job closed before completion was recorded");
                return Ok(TaskOutcome::skipped(SkipReason::JobClosed));
            }
            Err(e) => return Err(e.into()),
        };
        if finalized.changed {
            if succeeded {
                self.stats.job_succeeded();
            } else {
                self.stats.job_failed();
            }
            info!(job_id = %job_id, status = %finalized.job.status, "job finalized");
        }
        Ok(TaskOutcome::Completed)
    }

    fn drop_message(&self, message: &TaskMessage, reason: String) -> TaskOutcome {
        self.stats.message_dropped();
        warn!(task = %message, reason = %reason, "dropping malformed task");
        TaskOutcome::skipped(SkipReason::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let value = serde_json::to_value(TaskOutcome::skipped(SkipReason::PredecessorPending)).unwrap();
        assert_eq!(value, serde_json::json!({"status": "skipped", "reason": "predecessor_pending"}));
        let value = serde_json::to_value(TaskOutcome::Completed).unwrap();
        assert_eq!(value, serde_json::json!({"status": "completed"}));
    }

    #[test]
    fn lease_held_stays_pending_on_pull_queue() {
        let held = TaskOutcome::skipped(SkipReason::LeaseHeld);
        assert!(held.is_ack());
        assert!(!held.settles_pull_entry());

        let retry = TaskOutcome::Retry { reason: "busy".into() };
        assert!(!retry.settles_pull_entry());

        for settled in [
            TaskOutcome::Completed,
            TaskOutcome::skipped(SkipReason::JobClosed),
            TaskOutcome::skipped(SkipReason::LeaseLost),
            TaskOutcome::skipped(SkipReason::Malformed),
            TaskOutcome::skipped(SkipReason::PredecessorPending),
        ] {
            assert!(settled.settles_pull_entry(), "{settled:?}");
        }
    }
}
