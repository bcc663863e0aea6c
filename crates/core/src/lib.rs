//! `fleetroute-core`: job orchestration domain.
//!
//! This crate contains **pure domain** logic (no IO): job records, step
//! leases and the transitions between them. Every function that depends on
//! time takes `now` explicitly.

pub mod error;
pub mod id;
pub mod job;
pub mod lease;
pub mod step;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{ClaimState, Completion, Job, JobStatus, JobType, scaled_step_pct, step_completion_pct};
pub use lease::{Lease, LeaseOutcome, MIN_LEASE_SECONDS, effective_lease};
pub use step::{StepName, StepOutcome, StepState, StepStatus};
pub use version::ExpectedVersion;
