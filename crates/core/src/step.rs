//! Pipeline steps and their per-step lease state.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Closed set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepName {
    Geocode,
    BuildMatrix,
    Optimize,
    GenerateExports,
}

impl StepName {
    /// The route-optimization chain in execution order.
    pub const OPTIMIZE_CHAIN: [StepName; 4] = [
        StepName::Geocode,
        StepName::BuildMatrix,
        StepName::Optimize,
        StepName::GenerateExports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Geocode => "GEOCODE",
            StepName::BuildMatrix => "BUILD_MATRIX",
            StepName::Optimize => "OPTIMIZE",
            StepName::GenerateExports => "GENERATE_EXPORTS",
        }
    }
}

impl core::fmt::Display for StepName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GEOCODE" => Ok(StepName::Geocode),
            "BUILD_MATRIX" => Ok(StepName::BuildMatrix),
            "OPTIMIZE" => Ok(StepName::Optimize),
            "GENERATE_EXPORTS" => Ok(StepName::GenerateExports),
            other => Err(DomainError::validation(format!("unknown step: {other}"))),
        }
    }
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    /// Last attempt failed; eligible for another lease.
    Failed,
}

/// What a worker reports when it gives a step (or a single-shot job) back.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        output: serde_json::Value,
    },
    Failed {
        code: String,
        detail: String,
    },
}

impl StepOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self::Succeeded { output }
    }

    pub fn failure(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }
}

/// Durable state of one step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: StepName,
    pub status: StepStatus,
    /// Incremented on every lease acquisition, including reclaims.
    pub attempt_count: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub stale_reclaimed_count: u32,
    pub output_ref: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepState {
    pub fn pending(name: StepName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempt_count: 0,
            lease_owner: None,
            lease_expires_at: None,
            stale_reclaimed_count: 0,
            output_ref: None,
            error_code: None,
            error_detail: None,
            updated_at: now,
        }
    }

    /// True when `owner` is the current holder of a running lease.
    ///
    /// Expiry alone does not revoke ownership; only a reclaim by another
    /// worker does.
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.status == StepStatus::Running && self.lease_owner.as_deref() == Some(owner)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_round_trip_through_wire_form() {
        for step in StepName::OPTIMIZE_CHAIN {
            let parsed: StepName = step.as_str().parse().unwrap();
            assert_eq!(parsed, step);
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }
    }

    #[test]
    fn step_name_parse_is_case_insensitive() {
        assert_eq!("build_matrix".parse::<StepName>().unwrap(), StepName::BuildMatrix);
        assert!("SOLVE".parse::<StepName>().is_err());
    }

    #[test]
    fn expired_lease_is_still_held_until_reclaimed() {
        let now = Utc::now();
        let mut step = StepState::pending(StepName::Optimize, now);
        step.status = StepStatus::Running;
        step.lease_owner = Some("w1".into());
        step.lease_expires_at = Some(now - chrono::Duration::seconds(30));

        assert!(step.is_held_by("w1"));
        assert!(!step.is_held_by("w2"));
    }
}
