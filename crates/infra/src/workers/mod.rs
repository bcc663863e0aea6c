//! Background workers.

pub mod pull_worker;

pub use pull_worker::{PullQueueWorker, PullWorkerConfig, WorkerHandle};
