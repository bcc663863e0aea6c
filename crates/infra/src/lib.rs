//! Infrastructure layer: record stores, leases, queue transports, executors
//! and the runner/handler that tie them together.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod executors;
pub mod jobs;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod task_auth;
pub mod task_handler;
#[cfg(feature = "redis")]
pub mod workers;


pub use config::{ConfigError, DispatchMode, EngineConfig};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use service::{JobService, ServiceError};
pub use task_handler::{SkipReason, TaskError, TaskHandler, TaskOutcome};
