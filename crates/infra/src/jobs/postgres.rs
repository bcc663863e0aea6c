//! Postgres-backed job record store.
//!
//! One row per job. Step states and the single-shot claim are stored as JSONB
//! since they are always read and written together with the row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Inserts use `ON CONFLICT DO NOTHING` and updates are guarded by
//! `version`, so a compare-and-set that matches no row maps to `Conflict`
//! without relying on constraint violations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use fleetroute_core::{ClaimState, DomainError, ExpectedVersion, Job, JobId, StepName, StepState};

use super::store::{JobRecordStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    job_type      TEXT NOT NULL,
    status        TEXT NOT NULL,
    current_step  TEXT NULL,
    steps         JSONB NOT NULL DEFAULT '[]'::jsonb,
    progress_pct  SMALLINT NOT NULL DEFAULT 0 CHECK (progress_pct BETWEEN 0 AND 100),
    message       TEXT NOT NULL DEFAULT '',
    payload       JSONB NOT NULL,
    result_ref    JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_code    TEXT NULL,
    error_detail  TEXT NULL,
    claim         JSONB NOT NULL DEFAULT '{}'::jsonb,
    version       BIGINT NOT NULL CHECK (version > 0),
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_updated_at_idx ON jobs (updated_at DESC);
CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status);
"#;

const SELECT_COLUMNS: &str = "id, job_type, status, current_step, steps, progress_pct, message, \
     payload, result_ref, error_code, error_detail, claim, version, created_at, updated_at";

/// Postgres-backed [`JobRecordStore`].
///
/// Uses the SQLx connection pool, which is `Send + Sync`; the store can be
/// shared freely across tasks.
#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table and indexes if missing.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn insert(&self, job: &Job) -> Result<Job, JobStoreError> {
        let mut stored = job.clone();
        stored.version = 1;
        let enc = EncodedJob::encode(&stored)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, current_step, steps, progress_pct, message,
                payload, result_ref, error_code, error_detail, claim, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(stored.id.as_str())
        .bind(stored.job_type.as_str())
        .bind(stored.status.as_str())
        .bind(stored.current_step.map(|s| s.as_str()))
        .bind(&enc.steps)
        .bind(i16::from(stored.progress_pct))
        .bind(&stored.message)
        .bind(&stored.payload)
        .bind(&stored.result_ref)
        .bind(&stored.error_code)
        .bind(&stored.error_detail)
        .bind(&enc.claim)
        .bind(1_i64)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::Conflict {
                job_id: stored.id,
                detail: "job already exists".to_string(),
            });
        }
        Ok(stored)
    }

    async fn update(&self, job: &Job, expected: u64) -> Result<Job, JobStoreError> {
        let mut stored = job.clone();
        stored.version = expected + 1;
        let enc = EncodedJob::encode(&stored)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $3,
                current_step = $4,
                steps = $5,
                progress_pct = $6,
                message = $7,
                result_ref = $8,
                error_code = $9,
                error_detail = $10,
                claim = $11,
                version = $12,
                updated_at = $13
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(stored.id.as_str())
        .bind(expected as i64)
        .bind(stored.status.as_str())
        .bind(stored.current_step.map(|s| s.as_str()))
        .bind(&enc.steps)
        .bind(i16::from(stored.progress_pct))
        .bind(&stored.message)
        .bind(&stored.result_ref)
        .bind(&stored.error_code)
        .bind(&stored.error_detail)
        .bind(&enc.claim)
        .bind(stored.version as i64)
        .bind(stored.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::Conflict {
                job_id: stored.id,
                detail: format!("expected version {expected}"),
            });
        }
        Ok(stored)
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn load(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|r| JobRow::from_row(&r).and_then(JobRow::into_job))
            .transpose()
    }

    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            status = %job.status,
            expected = ?expected,
            version = tracing::field::Empty
        ),
        err
    )]
    async fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let stored = match expected {
            ExpectedVersion::New => self.insert(job).await?,
            ExpectedVersion::Exact(v) => self.update(job, v).await?,
        };
        Span::current().record("version", stored.version);
        Ok(stored)
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_recent", e))?;

        rows.iter()
            .map(|r| JobRow::from_row(r).and_then(JobRow::into_job))
            .collect()
    }
}

struct EncodedJob {
    steps: serde_json::Value,
    claim: serde_json::Value,
}

impl EncodedJob {
    fn encode(job: &Job) -> Result<Self, JobStoreError> {
        Ok(Self {
            steps: serde_json::to_value(&job.steps)
                .map_err(|e| JobStoreError::Serialization(format!("steps: {e}")))?,
            claim: serde_json::to_value(&job.claim)
                .map_err(|e| JobStoreError::Serialization(format!("claim: {e}")))?,
        })
    }
}

/// Internal row representation for mapping `jobs` rows.
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    current_step: Option<String>,
    steps: serde_json::Value,
    progress_pct: i16,
    message: String,
    payload: serde_json::Value,
    result_ref: serde_json::Value,
    error_code: Option<String>,
    error_detail: Option<String>,
    claim: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        let get = |e: sqlx::Error| JobStoreError::Serialization(format!("failed to read job row: {e}"));
        Ok(Self {
            id: row.try_get("id").map_err(get)?,
            job_type: row.try_get("job_type").map_err(get)?,
            status: row.try_get("status").map_err(get)?,
            current_step: row.try_get("current_step").map_err(get)?,
            steps: row.try_get("steps").map_err(get)?,
            progress_pct: row.try_get("progress_pct").map_err(get)?,
            message: row.try_get("message").map_err(get)?,
            payload: row.try_get("payload").map_err(get)?,
            result_ref: row.try_get("result_ref").map_err(get)?,
            error_code: row.try_get("error_code").map_err(get)?,
            error_detail: row.try_get("error_detail").map_err(get)?,
            claim: row.try_get("claim").map_err(get)?,
            version: row.try_get("version").map_err(get)?,
            created_at: row.try_get("created_at").map_err(get)?,
            updated_at: row.try_get("updated_at").map_err(get)?,
        })
    }

    fn into_job(self) -> Result<Job, JobStoreError> {
        let bad = |field: &str, e: String| JobStoreError::Serialization(format!("{field}: {e}"));
        let steps: Vec<StepState> =
            serde_json::from_value(self.steps).map_err(|e| bad("steps", e.to_string()))?;
        let claim: ClaimState =
            serde_json::from_value(self.claim).map_err(|e| bad("claim", e.to_string()))?;
        let current_step = self
            .current_step
            .map(|s| s.parse::<StepName>())
            .transpose()
            .map_err(|e| bad("current_step", e.to_string()))?;

        Ok(Job {
            id: self.id.parse().map_err(|e: DomainError| bad("id", e.to_string()))?,
            job_type: self.job_type.parse().map_err(|e: DomainError| bad("job_type", e.to_string()))?,
            status: self.status.parse().map_err(|e: DomainError| bad("status", e.to_string()))?,
            current_step,
            steps,
            progress_pct: self.progress_pct.clamp(0, 100) as u8,
            message: self.message,
            payload: self.payload,
            result_ref: self.result_ref,
            error_code: self.error_code,
            error_detail: self.error_detail,
            claim,
            version: self.version.max(0) as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
