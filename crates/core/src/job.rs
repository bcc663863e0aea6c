//! The job record and its transitions.
//!
//! Every transition is a pure function of the current record, the caller's
//! arguments and an explicit `now`. Persistence (and the compare-and-set loop
//! around it) lives in the infrastructure crate.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::lease::{Lease, LeaseOutcome, SlotState, slot_state};
use crate::step::{StepName, StepOutcome, StepState, StepStatus};

/// Maximum stored length of `Job::message`.
pub const MAX_MESSAGE_CHARS: usize = 512;

/// Maximum stored length of error details.
pub const MAX_ERROR_DETAIL_CHARS: usize = 4000;

/// Closed set of job kinds the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    OptimizePipeline,
    Geocode,
    ExportPdf,
    GenerateMapPng,
    MlTrain,
    MlMonitor,
    MlRetrainIfNeeded,
    MlEvaluation,
    OptimizeAbSimulation,
}

impl JobType {
    pub const ALL: [JobType; 9] = [
        JobType::OptimizePipeline,
        JobType::Geocode,
        JobType::ExportPdf,
        JobType::GenerateMapPng,
        JobType::MlTrain,
        JobType::MlMonitor,
        JobType::MlRetrainIfNeeded,
        JobType::MlEvaluation,
        JobType::OptimizeAbSimulation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::OptimizePipeline => "OPTIMIZE_PIPELINE",
            JobType::Geocode => "GEOCODE",
            JobType::ExportPdf => "EXPORT_PDF",
            JobType::GenerateMapPng => "GENERATE_MAP_PNG",
            JobType::MlTrain => "ML_TRAIN",
            JobType::MlMonitor => "ML_MONITOR",
            JobType::MlRetrainIfNeeded => "ML_RETRAIN_IF_NEEDED",
            JobType::MlEvaluation => "ML_EVALUATION",
            JobType::OptimizeAbSimulation => "OPTIMIZE_AB_SIMULATION",
        }
    }

    /// Default step chain for multi-stage job types.
    pub fn default_chain(&self) -> Option<&'static [StepName]> {
        match self {
            JobType::OptimizePipeline => Some(&StepName::OPTIMIZE_CHAIN),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unsupported job type: {s}")))
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Terminal transition requested through [`Job::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Succeeded { result: serde_json::Value },
    Failed { code: String, detail: String },
    Cancelled,
}

impl Completion {
    pub fn failed(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Completion::Succeeded { .. } => JobStatus::Succeeded,
            Completion::Failed { .. } => JobStatus::Failed,
            Completion::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Lease state for jobs that run as one unit (no step chain).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimState {
    pub owner: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub stale_reclaimed_count: u32,
    pub last_error_code: Option<String>,
    pub last_error_detail: Option<String>,
}

/// Durable record of one submitted long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub current_step: Option<StepName>,
    /// Ordered step chain; empty for single-shot jobs.
    pub steps: Vec<StepState>,
    pub progress_pct: u8,
    pub message: String,
    pub payload: serde_json::Value,
    /// Accumulated step outputs (always a JSON object).
    pub result_ref: serde_json::Value,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub claim: ClaimState,
    /// Record revision, bumped by the store on every successful write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a QUEUED job. A non-empty `chain` makes it a pipeline job with
    /// one PENDING step per entry.
    pub fn new(
        id: JobId,
        job_type: JobType,
        payload: serde_json::Value,
        chain: &[StepName],
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        for (idx, step) in chain.iter().enumerate() {
            if chain[..idx].contains(step) {
                return Err(DomainError::validation(format!(
                    "step {step} appears twice in chain"
                )));
            }
        }

        Ok(Self {
            id,
            job_type,
            status: JobStatus::Queued,
            current_step: None,
            steps: chain.iter().map(|s| StepState::pending(*s, now)).collect(),
            progress_pct: 0,
            message: "Queued".to_string(),
            payload,
            result_ref: serde_json::Value::Object(Default::default()),
            error_code: None,
            error_detail: None,
            claim: ClaimState::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_pipeline(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, name: StepName) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: StepName) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn first_step(&self) -> Option<StepName> {
        self.steps.first().map(|s| s.name)
    }

    /// The step after `name`, or `None` when `name` is last (or unknown).
    pub fn next_step(&self, name: StepName) -> Option<StepName> {
        let idx = self.step_index(name)?;
        self.steps.get(idx + 1).map(|s| s.name)
    }

    pub fn all_steps_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Succeeded)
    }

    /// Earliest step that has not succeeded yet.
    pub fn first_unfinished_step(&self) -> Option<StepName> {
        self.steps
            .iter()
            .find(|s| s.status != StepStatus::Succeeded)
            .map(|s| s.name)
    }

    fn step_mut(&mut self, name: StepName) -> DomainResult<&mut StepState> {
        self.steps
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or(DomainError::UnknownStep(name))
    }

    fn ensure_open(&self) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::Closed(self.status));
        }
        Ok(())
    }

    // --- step leases -----------------------------------------------------

    /// Try to take the lease on `step` for `owner`.
    pub fn acquire_step(
        &mut self,
        step: StepName,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<LeaseOutcome> {
        validate_owner(owner)?;
        if self.status.is_terminal() {
            return Ok(LeaseOutcome::Closed(self.status));
        }

        let state = self.step_mut(step)?;
        let previous_owner = match state.status {
            StepStatus::Succeeded => return Ok(LeaseOutcome::AlreadyComplete),
            StepStatus::Pending | StepStatus::Failed => None,
            StepStatus::Running => match slot_state(true, state.lease_expires_at, now) {
                SlotState::Held => {
                    return Ok(LeaseOutcome::Denied {
                        holder: state.lease_owner.clone(),
                        expires_at: state.lease_expires_at,
                    });
                }
                _ => Some(state.lease_owner.clone()),
            },
        };

        let expires_at = now + lease;
        state.status = StepStatus::Running;
        state.attempt_count += 1;
        state.lease_owner = Some(owner.to_string());
        state.lease_expires_at = Some(expires_at);
        state.updated_at = now;

        let granted = Lease {
            owner: owner.to_string(),
            expires_at,
            attempt: state.attempt_count,
        };
        let outcome = match previous_owner {
            None => LeaseOutcome::Granted(granted),
            Some(previous_owner) => {
                state.stale_reclaimed_count += 1;
                LeaseOutcome::StaleReclaimed {
                    lease: granted,
                    previous_owner,
                    reclaimed_count: state.stale_reclaimed_count,
                }
            }
        };

        self.status = JobStatus::Running;
        self.current_step = Some(step);
        self.updated_at = now;
        Ok(outcome)
    }

    /// Push the expiry of a held lease forward. Returns `false` when the lease
    /// is no longer held by `owner`.
    pub fn touch_step(
        &mut self,
        step: StepName,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let Ok(state) = self.step_mut(step) else {
            return false;
        };
        if !state.is_held_by(owner) {
            return false;
        }
        state.lease_expires_at = Some(now + lease);
        state.updated_at = now;
        self.updated_at = now;
        true
    }

    pub fn holds_step(&self, step: StepName, owner: &str) -> bool {
        !self.status.is_terminal() && self.step(step).is_some_and(|s| s.is_held_by(owner))
    }

    /// Record a step's outcome into the job while the lease is held.
    pub fn merge_step_result(
        &mut self,
        step: StepName,
        owner: &str,
        outcome: &StepOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        let state = self.step_mut(step)?;
        if !state.is_held_by(owner) {
            return Err(DomainError::lock_not_held(step.as_str()));
        }

        match outcome {
            StepOutcome::Succeeded { output } => {
                state.output_ref = Some(output.clone());
                state.updated_at = now;
                merge_json(&mut self.result_ref, output.clone(), step.as_str());
            }
            StepOutcome::Failed { code, detail } => {
                state.error_code = Some(code.clone());
                state.error_detail = Some(truncate(detail, MAX_ERROR_DETAIL_CHARS));
                state.updated_at = now;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Give the lease back, moving the step to SUCCEEDED or FAILED.
    pub fn release_step(
        &mut self,
        step: StepName,
        owner: &str,
        outcome: &StepOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        let state = self.step_mut(step)?;
        if !state.is_held_by(owner) {
            return Err(DomainError::lock_not_held(step.as_str()));
        }

        match outcome {
            StepOutcome::Succeeded { output } => {
                state.status = StepStatus::Succeeded;
                if state.output_ref.is_none() {
                    state.output_ref = Some(output.clone());
                }
                state.error_code = None;
                state.error_detail = None;
            }
            StepOutcome::Failed { code, detail } => {
                state.status = StepStatus::Failed;
                state.error_code = Some(code.clone());
                state.error_detail = Some(truncate(detail, MAX_ERROR_DETAIL_CHARS));
            }
        }
        state.clear_lease();
        state.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    // --- single-shot claims ----------------------------------------------

    /// Lease the whole job for a single-shot executor.
    pub fn acquire_claim(
        &mut self,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<LeaseOutcome> {
        validate_owner(owner)?;
        if self.is_pipeline() {
            return Err(DomainError::invariant(
                "pipeline jobs are leased per step, not as a whole",
            ));
        }
        if self.status.is_terminal() {
            return Ok(LeaseOutcome::Closed(self.status));
        }

        let claim = &mut self.claim;
        let previous_owner = match slot_state(claim.owner.is_some(), claim.expires_at, now) {
            SlotState::Held => {
                return Ok(LeaseOutcome::Denied {
                    holder: claim.owner.clone(),
                    expires_at: claim.expires_at,
                });
            }
            SlotState::Expired => Some(claim.owner.clone()),
            SlotState::Free => None,
        };

        let expires_at = now + lease;
        claim.owner = Some(owner.to_string());
        claim.expires_at = Some(expires_at);
        claim.attempt_count += 1;

        let granted = Lease {
            owner: owner.to_string(),
            expires_at,
            attempt: claim.attempt_count,
        };
        let outcome = match previous_owner {
            None => LeaseOutcome::Granted(granted),
            Some(previous_owner) => {
                claim.stale_reclaimed_count += 1;
                LeaseOutcome::StaleReclaimed {
                    lease: granted,
                    previous_owner,
                    reclaimed_count: claim.stale_reclaimed_count,
                }
            }
        };

        self.status = JobStatus::Running;
        self.updated_at = now;
        Ok(outcome)
    }

    pub fn holds_claim(&self, owner: &str) -> bool {
        !self.status.is_terminal() && self.claim.owner.as_deref() == Some(owner)
    }

    pub fn touch_claim(&mut self, owner: &str, lease: Duration, now: DateTime<Utc>) -> bool {
        if !self.holds_claim(owner) {
            return false;
        }
        self.claim.expires_at = Some(now + lease);
        self.updated_at = now;
        true
    }

    /// Drop a claim after a failed attempt so the job can be leased again.
    pub fn release_claim(
        &mut self,
        owner: &str,
        outcome: &StepOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        if self.claim.owner.as_deref() != Some(owner) {
            return Err(DomainError::lock_not_held(self.id.as_str()));
        }
        if let StepOutcome::Failed { code, detail } = outcome {
            self.claim.last_error_code = Some(code.clone());
            self.claim.last_error_detail = Some(truncate(detail, MAX_ERROR_DETAIL_CHARS));
        }
        self.claim.owner = None;
        self.claim.expires_at = None;
        self.updated_at = now;
        Ok(())
    }

    // --- progress & completion -------------------------------------------

    /// Raise progress (and optionally replace the status line).
    ///
    /// Ignored for terminal jobs and for values below the stored progress.
    /// Returns whether anything changed.
    pub fn update_progress(&mut self, pct: i64, message: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let pct = pct.clamp(0, 100) as u8;
        if pct < self.progress_pct {
            return false;
        }
        let message = message.map(|m| truncate(m, MAX_MESSAGE_CHARS));
        if pct == self.progress_pct && message.as_ref().is_none_or(|m| *m == self.message) {
            return false;
        }

        self.progress_pct = pct;
        if let Some(message) = message {
            self.message = message;
        }
        self.updated_at = now;
        true
    }

    /// Move the job to a terminal status.
    ///
    /// Returns `Ok(false)` when the job already holds the same terminal
    /// status; a different terminal status is a conflict.
    pub fn finalize(&mut self, completion: Completion, now: DateTime<Utc>) -> DomainResult<bool> {
        let target = completion.status();
        if self.status.is_terminal() {
            if self.status == target {
                return Ok(false);
            }
            return Err(DomainError::conflict(format!(
                "job already {}, cannot become {}",
                self.status, target
            )));
        }

        match completion {
            Completion::Succeeded { result } => {
                if let Some(step) = self.first_unfinished_step() {
                    return Err(DomainError::invariant(format!(
                        "cannot succeed while step {step} is unfinished"
                    )));
                }
                merge_json(&mut self.result_ref, result, "result");
                self.progress_pct = 100;
                self.message = "Completed".to_string();
            }
            Completion::Failed { code, detail } => {
                self.message = truncate(&format!("Failed: {code}"), MAX_MESSAGE_CHARS);
                self.error_code = Some(code);
                self.error_detail = Some(truncate(&detail, MAX_ERROR_DETAIL_CHARS));
            }
            Completion::Cancelled => {
                self.message = "Cancelled".to_string();
            }
        }

        for step in &mut self.steps {
            step.clear_lease();
        }
        self.claim.owner = None;
        self.claim.expires_at = None;
        self.status = target;
        self.updated_at = now;
        Ok(true)
    }
}

/// Progress reached once step `idx` (0-based) of `total` has succeeded.
pub fn step_completion_pct(idx: usize, total: usize) -> i64 {
    if total == 0 {
        return 100;
    }
    (100 * (idx as i64 + 1)) / total as i64
}

/// Map an executor's inner 0–100 progress into step `idx`'s slice of the
/// overall bar.
pub fn scaled_step_pct(idx: usize, total: usize, inner: i64) -> i64 {
    if total == 0 {
        return inner.clamp(0, 100);
    }
    let lo = (100 * idx as i64) / total as i64;
    let hi = step_completion_pct(idx, total);
    lo + (hi - lo) * inner.clamp(0, 100) / 100
}

fn validate_owner(owner: &str) -> DomainResult<()> {
    if owner.trim().is_empty() {
        return Err(DomainError::validation("lease owner must not be empty"));
    }
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Shallow-merge `value` into the object `target`. Non-object values are
/// stored under `fallback_key`.
fn merge_json(target: &mut serde_json::Value, value: serde_json::Value, fallback_key: &str) {
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    let Some(map) = target.as_object_mut() else {
        return;
    };
    match value {
        serde_json::Value::Object(fields) => map.extend(fields),
        serde_json::Value::Null => {}
        other => {
            map.insert(fallback_key.to_string(), other);
        }
    }
}
