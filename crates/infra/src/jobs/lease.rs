//! Step Lease Manager.
//!
//! Time-bounded exclusive ownership of a (job, step) pair, persisted on the
//! job record. Lease expiry is the only liveness signal: nothing tracks
//! which workers are alive.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use fleetroute_core::{Job, JobId, LeaseOutcome, StepName, StepOutcome, effective_lease};

use super::records::{JobRecords, RecordError};
use crate::stats::EngineStats;

pub struct StepLeaseManager {
    records: Arc<JobRecords>,
    lease_seconds: i64,
    stats: Arc<EngineStats>,
}

impl StepLeaseManager {
    pub fn new(records: Arc<JobRecords>, lease_seconds: i64, stats: Arc<EngineStats>) -> Self {
        Self {
            records,
            lease_seconds,
            stats,
        }
    }

    /// Configured lease length (before clamping to the minimum).
    pub fn lease_seconds(&self) -> i64 {
        self.lease_seconds
    }

    pub fn records(&self) -> &Arc<JobRecords> {
        &self.records
    }

    /// Try to lease `step` of `job_id` for `owner`.
    #[instrument(skip(self), fields(job_id = %job_id, step = %step), err)]
    pub async fn acquire(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<LeaseOutcome, RecordError> {
        let lease = effective_lease(lease_seconds);
        let (_, outcome) = self
            .records
            .mutate(job_id, |job, now| job.acquire_step(step, owner, lease, now))
            .await?;
        self.observe(job_id, Some(step), owner, &outcome);
        Ok(outcome)
    }

    /// Extend a held lease by the configured length.
    ///
    /// Returns `false` (and logs) when the lease was lost; callers decide
    /// whether to keep going.
    pub async fn touch(&self, job_id: &JobId, step: StepName, owner: &str) -> Result<bool, RecordError> {
        let lease = effective_lease(self.lease_seconds);
        let (_, held) = self
            .records
            .mutate(job_id, |job, now| Ok(job.touch_step(step, owner, lease, now)))
            .await?;
        if !held {
            warn!(job_id = %job_id, step = %step, owner, "lease touch refused; lease no longer held");
        }
        Ok(held)
    }

    /// Release the lease, moving the step to SUCCEEDED or FAILED.
    #[instrument(skip(self, outcome), fields(job_id = %job_id, step = %step, success = outcome.is_success()), err)]
    pub async fn release(
        &self,
        job_id: &JobId,
        step: StepName,
        owner: &str,
        outcome: &StepOutcome,
    ) -> Result<Job, RecordError> {
        let (job, _) = self
            .records
            .mutate(job_id, |job, now| job.release_step(step, owner, outcome, now))
            .await?;
        Ok(job)
    }

    pub async fn holds(&self, job_id: &JobId, step: StepName, owner: &str) -> Result<bool, RecordError> {
        Ok(self.records.get(job_id).await?.holds_step(step, owner))
    }

    /// Lease a single-shot job as a whole.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn acquire_claim(
        &self,
        job_id: &JobId,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<LeaseOutcome, RecordError> {
        let lease = effective_lease(lease_seconds);
        let (_, outcome) = self
            .records
            .mutate(job_id, |job, now| job.acquire_claim(owner, lease, now))
            .await?;
        self.observe(job_id, None, owner, &outcome);
        Ok(outcome)
    }

    pub async fn touch_claim(&self, job_id: &JobId, owner: &str) -> Result<bool, RecordError> {
        let lease = effective_lease(self.lease_seconds);
        let (_, held) = self
            .records
            .mutate(job_id, |job, now| Ok(job.touch_claim(owner, lease, now)))
            .await?;
        if !held {
            warn!(job_id = %job_id, owner, "claim touch refused; claim no longer held");
        }
        Ok(held)
    }

    /// Drop a single-shot claim after a failed attempt.
    pub async fn release_claim(
        &self,
        job_id: &JobId,
        owner: &str,
        outcome: &StepOutcome,
    ) -> Result<Job, RecordError> {
        let (job, _) = self
            .records
            .mutate(job_id, |job, now| job.release_claim(owner, outcome, now))
            .await?;
        Ok(job)
    }

    pub async fn holds_claim(&self, job_id: &JobId, owner: &str) -> Result<bool, RecordError> {
        Ok(self.records.get(job_id).await?.holds_claim(owner))
    }

    fn observe(&self, job_id: &JobId, step: Option<StepName>, owner: &str, outcome: &LeaseOutcome) {
        let step = step.map(|s| s.as_str()).unwrap_or("-");
        match outcome {
            LeaseOutcome::Granted(lease) => {
                debug!(job_id = %job_id, step, owner, attempt = lease.attempt, "lease granted");
            }
            LeaseOutcome::StaleReclaimed {
                lease,
                previous_owner,
                reclaimed_count,
            } => {
                self.stats.stale_reclaimed();
                warn!(
                    event = "pipeline.stale_lease_reclaimed",
                    job_id = %job_id,
                    step,
                    owner,
                    previous_owner = previous_owner.as_deref().unwrap_or("-"),
                    attempt = lease.attempt,
                    reclaimed_count,
                    "stale lease reclaimed"
                );
            }
            LeaseOutcome::Denied { holder, expires_at } => {
                self.stats.lease_denied();
                info!(
                    event = "pipeline.lease_denied",
                    job_id = %job_id,
                    step,
                    owner,
                    holder = holder.as_deref().unwrap_or("-"),
                    expires_at = ?expires_at,
                    "lease held elsewhere"
                );
            }
            LeaseOutcome::AlreadyComplete | LeaseOutcome::Closed(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use fleetroute_core::{JobType, StepStatus};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::InMemoryJobRecordStore;

    struct Fixture {
        leases: StepLeaseManager,
        clock: Arc<ManualClock>,
        stats: Arc<EngineStats>,
        job: Job,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let records = Arc::new(JobRecords::new(InMemoryJobRecordStore::arc(), clock.clone()));
        let stats = Arc::new(EngineStats::default());
        let job = records
            .create(JobType::OptimizePipeline, json!({}), &StepName::OPTIMIZE_CHAIN)
            .await
            .unwrap();
        Fixture {
            leases: StepLeaseManager::new(records, 5, stats.clone()),
            clock,
            stats,
            job,
        }
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_after_expiry() {
        let f = fixture().await;
        let first = f
            .leases
            .acquire(&f.job.id, StepName::BuildMatrix, "w1", 5)
            .await
            .unwrap();
        assert!(matches!(first, LeaseOutcome::Granted(_)));

        f.clock.advance(Duration::seconds(6));
        let second = f
            .leases
            .acquire(&f.job.id, StepName::BuildMatrix, "w2", 5)
            .await
            .unwrap();
        assert!(matches!(second, LeaseOutcome::StaleReclaimed { .. }));

        let job = f.leases.records().get(&f.job.id).await.unwrap();
        let step = job.step(StepName::BuildMatrix).unwrap();
        assert_eq!(step.stale_reclaimed_count, 1);
        assert_eq!(step.lease_owner.as_deref(), Some("w2"));
        assert_eq!(f.stats.snapshot().stale_reclaims, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one() {
        let f = fixture().await;
        let leases = Arc::new(f.leases);

        let mut handles = Vec::new();
        for i in 0..8 {
            let leases = leases.clone();
            let id = f.job.id.clone();
            handles.push(tokio::spawn(async move {
                leases
                    .acquire(&id, StepName::Geocode, &format!("w{i}"), 30)
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for h in handles {
            match h.await.unwrap() {
                LeaseOutcome::Granted(_) => granted += 1,
                LeaseOutcome::Denied { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(f.stats.snapshot().leases_denied, 7);
    }

    #[tokio::test]
    async fn touch_keeps_lease_alive() {
        let f = fixture().await;
        f.leases.acquire(&f.job.id, StepName::Optimize, "w1", 5).await.unwrap();

        f.clock.advance(Duration::seconds(4));
        assert!(f.leases.touch(&f.job.id, StepName::Optimize, "w1").await.unwrap());
        f.clock.advance(Duration::seconds(4));

        let other = f.leases.acquire(&f.job.id, StepName::Optimize, "w2", 5).await.unwrap();
        assert!(matches!(other, LeaseOutcome::Denied { .. }));
        assert!(!f.leases.touch(&f.job.id, StepName::Optimize, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn release_records_outcome_and_clears_lease() {
        let f = fixture().await;
        f.leases.acquire(&f.job.id, StepName::Geocode, "w1", 5).await.unwrap();

        let job = f
            .leases
            .release(&f.job.id, StepName::Geocode, "w1", &StepOutcome::success(json!({"ok": true})))
            .await
            .unwrap();
        let step = job.step(StepName::Geocode).unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert!(step.lease_owner.is_none());
        assert!(!f.leases.holds(&f.job.id, StepName::Geocode, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn short_lease_requests_are_clamped() {
        let f = fixture().await;
        f.leases.acquire(&f.job.id, StepName::Geocode, "w1", 1).await.unwrap();

        f.clock.advance(Duration::seconds(3));
        let second = f.leases.acquire(&f.job.id, StepName::Geocode, "w2", 1).await.unwrap();
        assert!(matches!(second, LeaseOutcome::Denied { .. }));
    }
}
