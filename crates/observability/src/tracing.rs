//! Tracing/logging initialization.
//!
//! JSON lines with timestamps; filter with `RUST_LOG` (default `info`).
//! Engine events carry a stable `event` field (`pipeline.complete`,
//! `dispatch.enqueue_failed`, ...) for log-based alerting.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_current_span(true)
        .try_init();
}
