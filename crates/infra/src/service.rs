//! Client-facing job operations: submit, inspect, cancel, retry.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument};

use fleetroute_core::{DomainError, Job, JobId, JobType, StepStatus};

use crate::dispatch::{EnqueueError, QueueDispatcher, TaskMessage};
use crate::executors::ExecutorRegistry;
use crate::jobs::{JobRecords, RecordError};
use crate::stats::EngineStats;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job type {0} has no registered executor")]
    Unsupported(JobType),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// The job record exists (QUEUED) but its first task never reached the queue.
    #[error("failed to enqueue {job_id}: {source}")]
    Enqueue {
        job_id: JobId,
        #[source]
        source: EnqueueError,
    },
}

pub struct JobService {
    records: Arc<JobRecords>,
    dispatcher: Arc<dyn QueueDispatcher>,
    registry: Arc<ExecutorRegistry>,
    stats: Arc<EngineStats>,
}

impl JobService {
    pub fn new(
        records: Arc<JobRecords>,
        dispatcher: Arc<dyn QueueDispatcher>,
        registry: Arc<ExecutorRegistry>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            records,
            dispatcher,
            registry,
            stats,
        }
    }

    pub fn records(&self) -> &Arc<JobRecords> {
        &self.records
    }

    /// Create the job and enqueue its first task.
    ///
    /// In inline mode the whole job runs before this returns, so the
    /// returned record is re-read after enqueue.
    #[instrument(skip(self, payload), fields(job_type = %job_type), err)]
    pub async fn submit_job(&self, job_type: JobType, payload: Value) -> Result<Job, ServiceError> {
        let chain = self
            .registry
            .chain(job_type)
            .ok_or(ServiceError::Unsupported(job_type))?;
        let job = self.records.create(job_type, payload, &chain).await?;
        info!(job_id = %job.id, steps = chain.len(), "job created");

        let message = match job.first_step() {
            Some(step) => TaskMessage::pipeline_step(&job.id, step),
            None => TaskMessage::generic_job(&job.id),
        };
        self.enqueue(&job.id, message).await?;
        Ok(self.records.get(&job.id).await?)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, ServiceError> {
        Ok(self.records.get(job_id).await?)
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, ServiceError> {
        Ok(self.records.list_recent(limit).await?)
    }

    /// Not preemptive: a running executor finishes, but its merge is rejected.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<Job, ServiceError> {
        Ok(self.records.cancel(job_id).await?)
    }

    /// Re-enqueue the earliest unfinished step (or the single-shot task) of a
    /// non-terminal job, e.g. after its queue entry was dead-lettered.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn retry_job(&self, job_id: &JobId) -> Result<Job, ServiceError> {
        let job = self.records.get(job_id).await?;
        if job.is_terminal() {
            return Err(RecordError::Domain(DomainError::Closed(job.status)).into());
        }

        let message = if job.is_pipeline() {
            let step = job
                .first_unfinished_step()
                .or_else(|| job.steps.last().map(|s| s.name))
                .ok_or_else(|| RecordError::Domain(DomainError::invariant("pipeline job without steps")))?;
            if job.step(step).map(|s| s.status) == Some(StepStatus::Running) {
                info!(step = %step, "step is running; retry will be denied unless its lease lapsed");
            }
            TaskMessage::pipeline_step(&job.id, step)
        } else {
            TaskMessage::generic_job(&job.id)
        };
        self.enqueue(&job.id, message).await?;
        Ok(self.records.get(job_id).await?)
    }

    async fn enqueue(&self, job_id: &JobId, message: TaskMessage) -> Result<(), ServiceError> {
        if let Err(source) = self.dispatcher.enqueue(message).await {
            self.stats.enqueue_failed();
            error!(
                event = "dispatch.enqueue_failed",
                job_id = %job_id,
                code = source.code(),
                error = %source,
                "failed to enqueue task"
            );
            return Err(ServiceError::Enqueue {
                job_id: job_id.clone(),
                source,
            });
        }
        Ok(())
    }
}
