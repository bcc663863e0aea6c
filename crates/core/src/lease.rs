//! Lease primitives shared by step leases and single-shot job claims.
//!
//! A lease is a time-bounded ownership token stored on the job record itself.
//! There is no registry of live workers: a holder is considered alive until
//! `expires_at` has passed, after which any other worker may reclaim the slot.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::job::JobStatus;

/// Lower bound applied to every requested lease duration.
pub const MIN_LEASE_SECONDS: i64 = 5;

/// Clamp a configured lease length to the supported minimum.
pub fn effective_lease(seconds: i64) -> Duration {
    Duration::seconds(seconds.max(MIN_LEASE_SECONDS))
}

/// An acquired lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    /// Attempt number this lease represents (1-based).
    pub attempt: u32,
}

/// Result of an acquire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted(Lease),
    /// The previous holder let its lease lapse; ownership moved to the caller.
    StaleReclaimed {
        lease: Lease,
        previous_owner: Option<String>,
        reclaimed_count: u32,
    },
    Denied {
        holder: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    AlreadyComplete,
    /// The job is terminal; nothing may be acquired.
    Closed(JobStatus),
}

impl LeaseOutcome {
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            LeaseOutcome::Granted(lease) | LeaseOutcome::StaleReclaimed { lease, .. } => Some(lease),
            _ => None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.lease().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Held,
    Expired,
}

/// Classify a lease slot at `now`. A lease is live up to and including its
/// expiry instant.
pub(crate) fn slot_state(
    running: bool,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SlotState {
    if !running {
        return SlotState::Free;
    }
    match expires_at {
        Some(at) if now <= at => SlotState::Held,
        _ => SlotState::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_leases_are_raised_to_minimum() {
        assert_eq!(effective_lease(1), Duration::seconds(MIN_LEASE_SECONDS));
        assert_eq!(effective_lease(-3), Duration::seconds(MIN_LEASE_SECONDS));
        assert_eq!(effective_lease(300), Duration::seconds(300));
    }

    #[test]
    fn slot_expires_strictly_after_deadline() {
        let at = Utc::now();
        assert_eq!(slot_state(true, Some(at), at), SlotState::Held);
        assert_eq!(
            slot_state(true, Some(at), at + Duration::milliseconds(1)),
            SlotState::Expired
        );
        assert_eq!(slot_state(true, None, at), SlotState::Expired);
        assert_eq!(slot_state(false, Some(at), at), SlotState::Free);
    }
}
