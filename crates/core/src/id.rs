//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const MAX_ID_LEN: usize = 64;

/// Client-facing identifier of a job (`job_<32 hex>`).
///
/// Parsing accepts any short token of ASCII alphanumerics, `_` and `-` so ids
/// minted by older deployments stay addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered) so ids sort roughly by submission time.
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::invalid_id("JobId: empty"));
        }
        if s.len() > MAX_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "JobId: longer than {MAX_ID_LEN} characters"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(DomainError::invalid_id(format!("JobId: unexpected character in {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_carry_prefix_and_hex_body() {
        let id = JobId::new();
        let body = id.as_str().strip_prefix("job_").unwrap();
        assert_eq!(body.len(), 32);
        assert!(body.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn parse_rejects_empty_and_path_like_ids() {
        assert!("".parse::<JobId>().is_err());
        assert!("   ".parse::<JobId>().is_err());
        assert!("job_1/../x".parse::<JobId>().is_err());
        assert!("job_abc".parse::<JobId>().is_ok());
    }

    #[test]
    fn deserialize_validates() {
        let ok: JobId = serde_json::from_str("\"job_42\"").unwrap();
        assert_eq!(ok.as_str(), "job_42");
        assert!(serde_json::from_str::<JobId>("\"\"").is_err());
    }
}
