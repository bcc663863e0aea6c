use axum::http::StatusCode;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use fleetroute_core::{Job, JobType, StepState, StepStatus};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type", alias = "job_type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct FleetConfig {
    pub num_vehicles: u32,
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_solver_time_limit")]
    pub solver_time_limit_s: u32,
    #[serde(default)]
    pub allow_drop_visits: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solver_time_limit_s: default_solver_time_limit(),
            allow_drop_visits: false,
        }
    }
}

fn default_solver_time_limit() -> u32 {
    15
}

fn default_workday_start() -> String {
    "08:00".to_string()
}

fn default_workday_end() -> String {
    "18:00".to_string()
}

/// Body of `POST /api/v1/jobs/optimize`.
#[derive(Debug, Deserialize)]
pub struct OptimizeJobRequest {
    pub dataset_id: i64,
    pub depot_lat: f64,
    pub depot_lon: f64,
    pub fleet_config: FleetConfig,
    #[serde(default = "default_workday_start")]
    pub workday_start: String,
    #[serde(default = "default_workday_end")]
    pub workday_end: String,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub use_live_traffic: bool,
}

impl OptimizeJobRequest {
    /// Validate and turn the request into the pipeline's job payload.
    pub fn into_payload(self) -> Result<Value, axum::response::Response> {
        let invalid = |msg: &str| errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg);

        if self.dataset_id <= 0 {
            return Err(invalid("dataset_id must be positive"));
        }
        if !(-90.0..=90.0).contains(&self.depot_lat) || !(-180.0..=180.0).contains(&self.depot_lon) {
            return Err(invalid("depot coordinates out of range"));
        }
        if self.fleet_config.num_vehicles == 0 || self.fleet_config.capacity == Some(0) {
            return Err(invalid("fleet_config needs at least one vehicle and a positive capacity"));
        }
        if !(5..=120).contains(&self.solver.solver_time_limit_s) {
            return Err(invalid("solver_time_limit_s must be between 5 and 120"));
        }
        let (start, end) = match (parse_hhmm(&self.workday_start), parse_hhmm(&self.workday_end)) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(invalid("workday_start/workday_end must be HH:MM (24-hour)")),
        };
        if start >= end {
            return Err(invalid("workday_start must be earlier than workday_end"));
        }

        Ok(json!({
            "dataset_id": self.dataset_id,
            "depot_lat": self.depot_lat,
            "depot_lon": self.depot_lon,
            "num_vehicles": self.fleet_config.num_vehicles,
            "capacity": self.fleet_config.capacity,
            "workday_start": start.format("%H:%M").to_string(),
            "workday_end": end.format("%H:%M").to_string(),
            "solver_time_limit_s": self.solver.solver_time_limit_s,
            "allow_drop_visits": self.solver.allow_drop_visits,
            "use_live_traffic": self.use_live_traffic,
        }))
    }
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub job_type: String,
}

impl From<&Job> for JobAccepted {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            status: job.status.to_string(),
            job_type: job.job_type.to_string(),
        }
    }
}

/// Client view of a job. Lease owners stay internal.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub progress_pct: u8,
    pub current_step: Option<String>,
    pub message: String,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub steps: Vec<StepView>,
    pub result_ref: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct StepView {
    pub name: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub stale_reclaimed_count: u32,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub updated_at: String,
}

impl From<&StepState> for StepView {
    fn from(step: &StepState) -> Self {
        Self {
            name: step.name.to_string(),
            status: step.status,
            attempt_count: step.attempt_count,
            stale_reclaimed_count: step.stale_reclaimed_count,
            error_code: step.error_code.clone(),
            error_detail: step.error_detail.clone(),
            updated_at: step.updated_at.to_rfc3339(),
        }
    }
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.to_string(),
            status: job.status.to_string(),
            progress_pct: job.progress_pct,
            current_step: job.current_step.map(|s| s.to_string()),
            message: job.message.clone(),
            error_code: job.error_code.clone(),
            error_detail: job.error_detail.clone(),
            steps: job.steps.iter().map(StepView::from).collect(),
            result_ref: job.result_ref.clone(),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}
