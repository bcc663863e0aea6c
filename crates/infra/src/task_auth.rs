//! Bearer tokens for task deliveries.
//!
//! The push dispatcher mints a short-lived HS256 token per delivery; the
//! `/tasks/handle` endpoint verifies signature, issuer and audience. Time
//! checks are done against an injected `now` so they stay deterministic.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TASK_TOKEN_ISSUER: &str = "fleetroute-dispatch";

/// Default token lifetime. Redeliveries reuse the token minted at enqueue
/// time, so it must outlive the push queue's longest retry backoff.
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskAuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid task token: {0}")]
    Invalid(String),

    #[error("task token has expired")]
    Expired,

    #[error("task token not yet valid")]
    NotYetValid,

    #[error("failed to sign task token: {0}")]
    Signing(String),
}

#[derive(Clone)]
pub struct TaskTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    audience: String,
    ttl: Duration,
}

impl std::fmt::Debug for TaskTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTokens")
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TaskTokens {
    pub fn new(secret: &str, audience: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            audience: audience.into(),
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECONDS),
        }
    }

    pub fn with_ttl_seconds(mut self, seconds: i64) -> Self {
        self.ttl = Duration::seconds(seconds.max(1));
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn issue(&self, subject: &str, now: DateTime<Utc>) -> Result<String, TaskAuthError> {
        let claims = TaskClaims {
            iss: TASK_TOKEN_ISSUER.to_string(),
            aud: self.audience.clone(),
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TaskAuthError::Signing(e.to_string()))
    }

    /// Verify signature, issuer and audience, then the time window at `now`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<TaskClaims, TaskAuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[TASK_TOKEN_ISSUER]);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<TaskClaims>(token, &self.decoding, &validation)
            .map_err(|e| TaskAuthError::Invalid(e.to_string()))?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

pub fn validate_claims(claims: &TaskClaims, now: DateTime<Utc>) -> Result<(), TaskAuthError> {
    if claims.exp <= claims.iat {
        return Err(TaskAuthError::Invalid("expires before it was issued".to_string()));
    }
    let now = now.timestamp();
    if now < claims.iat {
        return Err(TaskAuthError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TaskAuthError::Expired);
    }
    Ok(())
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, TaskAuthError> {
    let value = header.ok_or(TaskAuthError::Missing)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| TaskAuthError::Invalid("expected a Bearer token".to_string()))?
        .trim();
    if token.is_empty() {
        return Err(TaskAuthError::Missing);
    }
    Ok(token)
}
