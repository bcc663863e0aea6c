//! Domain error model.

use thiserror::Error;

use crate::job::JobStatus;
use crate::step::StepName;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures of job/step transitions only. Storage and transport
/// faults are modelled in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The step is not part of this job's chain.
    #[error("step {0} is not part of this job")]
    UnknownStep(StepName),

    /// The caller does not hold the lease it tried to act under.
    #[error("lease for {0} is not held by caller")]
    LockNotHeld(String),

    /// The job already reached a terminal status.
    #[error("job is closed ({0})")]
    Closed(JobStatus),

    /// A conflict occurred (e.g. different terminal status, stale version).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn lock_not_held(slot: impl Into<String>) -> Self {
        Self::LockNotHeld(slot.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
