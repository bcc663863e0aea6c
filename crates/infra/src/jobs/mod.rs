//! Durable job state: record storage, transitions under compare-and-set, and
//! step leases.
//!
//! ## Components
//!
//! - `JobRecordStore`: persistence of whole job records (in-memory or Postgres)
//! - `JobRecords`: create/get/progress/merge/finalize/cancel with CAS retries
//! - `StepLeaseManager`: acquire/touch/release of per-step and per-job leases

pub mod lease;
pub mod postgres;
pub mod records;
pub mod store;

pub use lease::StepLeaseManager;
pub use postgres::PostgresJobRecordStore;
pub use records::{Finalized, JobRecords, RecordError};
pub use store::{InMemoryJobRecordStore, JobRecordStore, JobStoreError};
