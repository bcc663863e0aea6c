//! Process-wide engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the lease manager, runner and dispatchers.
#[derive(Debug, Default)]
pub struct EngineStats {
    steps_started: AtomicU64,
    steps_succeeded: AtomicU64,
    steps_failed: AtomicU64,
    leases_denied: AtomicU64,
    stale_reclaims: AtomicU64,
    enqueue_failures: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub steps_started: u64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub leases_denied: u64,
    pub stale_reclaims: u64,
    pub enqueue_failures: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub messages_dropped: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> EngineStatsSnapshot {
                EngineStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counter! {
    step_started => steps_started,
    step_succeeded => steps_succeeded,
    step_failed => steps_failed,
    lease_denied => leases_denied,
    stale_reclaimed => stale_reclaims,
    enqueue_failed => enqueue_failures,
    job_succeeded => jobs_succeeded,
    job_failed => jobs_failed,
    message_dropped => messages_dropped,
}
