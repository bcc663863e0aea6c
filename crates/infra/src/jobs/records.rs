//! Job Record Store operations on top of a [`JobRecordStore`].
//!
//! Every mutation is a read-modify-write: load the record, apply a pure
//! transition from `fleetroute-core`, then compare-and-set on `version`.
//! A lost race re-reads and re-applies the transition, so decisions are
//! always made against the latest durable state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use fleetroute_core::{
    Completion, DomainError, ExpectedVersion, Job, JobId, JobType, StepName, StepOutcome,
};

use super::store::{JobRecordStore, JobStoreError};
use crate::clock::Clock;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("gave up on {job_id} after {attempts} conflicting writes")]
    Contention { job_id: JobId, attempts: u32 },
}

impl RecordError {
    pub fn is_lock_not_held(&self) -> bool {
        matches!(self, RecordError::Domain(DomainError::LockNotHeld(_)))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RecordError::Domain(DomainError::Closed(_)))
    }
}

/// Result of [`JobRecords::finalize`].
#[derive(Debug, Clone)]
pub struct Finalized {
    pub job: Job,
    /// `false` when the job already held the requested terminal status.
    pub changed: bool,
}

pub struct JobRecords {
    store: Arc<dyn JobRecordStore>,
    clock: Arc<dyn Clock>,
    write_retry: RetryPolicy,
}

impl JobRecords {
    pub fn new(store: Arc<dyn JobRecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_retry: RetryPolicy::for_record_writes(),
        }
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a QUEUED job; pipeline jobs get one PENDING step per `chain` entry.
    #[instrument(skip(self, payload), fields(job_type = %job_type), err)]
    pub async fn create(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        chain: &[StepName],
    ) -> Result<Job, RecordError> {
        let job = Job::new(JobId::new(), job_type, payload, chain, self.clock.now())?;
        Ok(self.store.save(&job, ExpectedVersion::New).await?)
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job, RecordError> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| RecordError::NotFound(job_id.clone()))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, RecordError> {
        Ok(self.store.list_recent(limit).await?)
    }

    /// Raise progress; lower values and terminal jobs are ignored.
    pub async fn update_progress(
        &self,
        job_id: &JobId,
        pct: i64,
        message: Option<&str>,
    ) -> Result<Job, RecordError> {
        let (job, _) = self
            .mutate(job_id, |job, now| Ok(job.update_progress(pct, message, now)))
            .await?;
        Ok(job)
    }

    /// Record a step outcome. Fails with `LockNotHeld` unless `owner` holds
    /// the step's lease, and with `Closed` once the job is terminal.
    pub async fn merge_step_result(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        outcome: &StepOutcome,
    ) -> Result<Job, RecordError> {
        let (job, _) = self
            .mutate(job_id, |job, now| job.merge_step_result(step, owner, outcome, now))
            .await?;
        Ok(job)
    }

    /// Move the job to a terminal status (idempotent for the same status).
    #[instrument(skip(self, completion), fields(job_id = %job_id, status = %completion.status()), err)]
    pub async fn finalize(
        &self,
        job_id: &JobId,
        completion: Completion,
    ) -> Result<Finalized, RecordError> {
        let (job, changed) = self
            .mutate(job_id, |job, now| job.finalize(completion.clone(), now))
            .await?;
        Ok(Finalized { job, changed })
    }

    /// Cancel a non-terminal job. Cancelling twice is a no-op.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Job, RecordError> {
        Ok(self.finalize(job_id, Completion::Cancelled).await?.job)
    }

    /// Apply `apply` under compare-and-set, retrying on version conflicts.
    ///
    /// When `apply` leaves the record unchanged nothing is written.
    pub(crate) async fn mutate<T, F>(
        &self,
        job_id: &JobId,
        mut apply: F,
    ) -> Result<(Job, T), RecordError>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> Result<T, DomainError> + Send,
        T: Send,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self.get(job_id).await?;
            let mut next = current.clone();
            let value = apply(&mut next, self.clock.now())?;
            if next == current {
                return Ok((current, value));
            }

            match self
                .store
                .save(&next, ExpectedVersion::Exact(current.version))
                .await
            {
                Ok(stored) => return Ok((stored, value)),
                Err(JobStoreError::Conflict { .. }) if self.write_retry.should_retry(attempts) => {
                    debug!(job_id = %job_id, attempts, "record write conflict; retrying");
                    tokio::time::sleep(self.write_retry.delay_for_attempt(attempts)).await;
                }
                Err(JobStoreError::Conflict { .. }) => {
                    warn!(job_id = %job_id, attempts, "record write contention; giving up");
                    return Err(RecordError::Contention {
                        job_id: job_id.clone(),
                        attempts,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
