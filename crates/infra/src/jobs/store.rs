//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use fleetroute_core::{ExpectedVersion, Job, JobId};

/// Durable key-value storage of job records with row-level compare-and-set.
///
/// Implementations only persist whole records; all transition logic lives in
/// [`Job`] and the compare-and-set loop in [`super::JobRecords`].
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Load a job by id.
    async fn load(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Write `job` if the stored revision matches `expected`.
    ///
    /// Returns the stored record with its bumped `version`.
    async fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    /// Most recently updated jobs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;
}

#[async_trait]
impl<T: JobRecordStore + ?Sized> JobRecordStore for Arc<T> {
    async fn load(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).load(job_id).await
    }

    async fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        (**self).save(job, expected).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_recent(limit).await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// Another writer got there first.
    #[error("version conflict on {job_id}: {detail}")]
    Conflict { job_id: JobId, detail: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn load(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().get(job_id).cloned())
    }

    async fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let actual = jobs.get(&job.id).map(|j| j.version);
        expected
            .check(actual)
            .map_err(|e| JobStoreError::Conflict {
                job_id: job.id.clone(),
                detail: e.to_string(),
            })?;

        let mut stored = job.clone();
        stored.version = actual.unwrap_or(0) + 1;
        jobs.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fleetroute_core::JobType;

    use super::*;

    fn job() -> Job {
        Job::new(JobId::new(), JobType::ExportPdf, serde_json::json!({}), &[], Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn insert_then_update_bumps_version() {
        let store = InMemoryJobRecordStore::new();
        let job = job();

        let stored = store.save(&job, ExpectedVersion::New).await.unwrap();
        assert_eq!(stored.version, 1);

        let stored = store.save(&stored, ExpectedVersion::Exact(1)).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(store.load(&job.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let store = InMemoryJobRecordStore::new();
        let stored = store.save(&job(), ExpectedVersion::New).await.unwrap();
        store.save(&stored, ExpectedVersion::Exact(1)).await.unwrap();

        let err = store.save(&stored, ExpectedVersion::Exact(1)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobRecordStore::new();
        let job = job();
        store.save(&job, ExpectedVersion::New).await.unwrap();
        assert!(store.save(&job, ExpectedVersion::New).await.is_err());
        assert_eq!(store.len(), 1);
    }
}
