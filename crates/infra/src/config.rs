//! Engine configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleetroute_core::MIN_LEASE_SECONDS;

/// Margin added to the lease when deriving the pull-queue reclaim idle.
const PULL_RECLAIM_MARGIN_SECONDS: u64 = 30;

/// Transport used for "run this step" messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Managed push queue delivering HTTP requests to `/tasks/handle`.
    Push,
    /// Redis stream drained by worker processes.
    Pull,
    /// Run the task handler in-process (local development, tests).
    Inline,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Push => "push",
            DispatchMode::Pull => "pull",
            DispatchMode::Inline => "inline",
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(DispatchMode::Push),
            "pull" => Ok(DispatchMode::Pull),
            "inline" => Ok(DispatchMode::Inline),
            other => Err(ConfigError::Invalid {
                key: "DISPATCH_MODE",
                reason: format!("expected push, pull or inline, got {other:?}"),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("{key} is required when {when}")]
    Missing { key: &'static str, when: &'static str },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dispatch_mode: DispatchMode,
    pub lease_seconds: i64,
    pub max_step_attempts: u32,
    pub inline_max_deliveries: u32,
    pub app_base_url: String,
    pub push_queue_url: Option<String>,
    pub push_queue_token: Option<String>,
    pub tasks_auth_secret: Option<String>,
    pub tasks_auth_required: bool,
    pub tasks_audience: String,
    /// Lifetime of the token minted per push delivery. Must cover the push
    /// queue's longest retry backoff.
    pub task_token_ttl_seconds: i64,
    pub redis_url: Option<String>,
    pub pull_queue_stream: String,
    /// Overrides the derived pull-queue reclaim idle; must exceed the lease.
    pub pull_retry_idle_seconds: Option<u64>,
    pub scheduler_enabled: bool,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub artifact_dir: Option<PathBuf>,
    pub executor_base_url: Option<String>,
    pub bind_addr: String,
    pub latency_warn_seconds: u64,
    pub worker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Inline,
            lease_seconds: 300,
            max_step_attempts: 5,
            inline_max_deliveries: 5,
            app_base_url: "http://127.0.0.1:8080".to_string(),
            push_queue_url: None,
            push_queue_token: None,
            tasks_auth_secret: None,
            tasks_auth_required: false,
            tasks_audience: "fleetroute-tasks".to_string(),
            task_token_ttl_seconds: 3600,
            redis_url: None,
            pull_queue_stream: "fleetroute:tasks".to_string(),
            pull_retry_idle_seconds: None,
            scheduler_enabled: false,
            database_url: None,
            use_persistent_stores: false,
            artifact_dir: None,
            executor_base_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            latency_warn_seconds: 120,
            worker_name: default_worker_name(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (environment, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let dispatch_mode = match get("DISPATCH_MODE") {
            Some(v) => v.parse()?,
            None => defaults.dispatch_mode,
        };

        let config = Self {
            dispatch_mode,
            lease_seconds: parse_or(get("PIPELINE_STEP_LEASE_SECONDS"), "PIPELINE_STEP_LEASE_SECONDS", defaults.lease_seconds)?
                .max(MIN_LEASE_SECONDS),
            max_step_attempts: parse_or(get("MAX_STEP_ATTEMPTS"), "MAX_STEP_ATTEMPTS", defaults.max_step_attempts)?,
            inline_max_deliveries: parse_or(
                get("INLINE_MAX_DELIVERIES"),
                "INLINE_MAX_DELIVERIES",
                defaults.inline_max_deliveries,
            )?,
            app_base_url: get("APP_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.app_base_url),
            push_queue_url: get("PUSH_QUEUE_URL"),
            push_queue_token: get("PUSH_QUEUE_TOKEN"),
            tasks_auth_secret: get("TASKS_AUTH_SECRET"),
            tasks_auth_required: parse_bool(get("TASKS_AUTH_REQUIRED"), "TASKS_AUTH_REQUIRED", true)?,
            tasks_audience: get("TASKS_AUDIENCE").unwrap_or(defaults.tasks_audience),
            task_token_ttl_seconds: parse_or(
                get("TASKS_TOKEN_TTL_SECONDS"),
                "TASKS_TOKEN_TTL_SECONDS",
                defaults.task_token_ttl_seconds,
            )?,
            redis_url: get("REDIS_URL"),
            pull_queue_stream: get("PULL_QUEUE_STREAM").unwrap_or(defaults.pull_queue_stream),
            pull_retry_idle_seconds: get("PULL_RETRY_IDLE_SECONDS")
                .map(|v| parse_or(Some(v), "PULL_RETRY_IDLE_SECONDS", 0_u64))
                .transpose()?,
            scheduler_enabled: parse_bool(get("SCHEDULER_ENABLED"), "SCHEDULER_ENABLED", false)?,
            database_url: get("DATABASE_URL"),
            use_persistent_stores: parse_bool(get("USE_PERSISTENT_STORES"), "USE_PERSISTENT_STORES", false)?,
            artifact_dir: get("ARTIFACT_DIR").map(PathBuf::from),
            executor_base_url: get("EXECUTOR_BASE_URL").map(|v| v.trim_end_matches('/').to_string()),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            latency_warn_seconds: parse_or(
                get("OPTIMIZE_LATENCY_WARN_SECONDS"),
                "OPTIMIZE_LATENCY_WARN_SECONDS",
                defaults.latency_warn_seconds,
            )?,
            worker_name: get("WORKER_NAME").unwrap_or(defaults.worker_name),
        };

        config.validate()?;
        Ok(config)
    }

    /// How long a pull-queue entry stays pending before another worker
    /// takes it over. Longer than the lease, so the takeover finds a crashed
    /// worker's lease expired rather than held.
    pub fn pull_retry_idle(&self) -> Duration {
        let lease = self.lease_seconds.max(MIN_LEASE_SECONDS) as u64;
        Duration::from_secs(
            self.pull_retry_idle_seconds
                .unwrap_or(lease + PULL_RECLAIM_MARGIN_SECONDS),
        )
    }

    /// Cross-field checks for the selected deployment shape.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_step_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_STEP_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.task_token_ttl_seconds <= 0 {
            return Err(ConfigError::Invalid {
                key: "TASKS_TOKEN_TTL_SECONDS",
                reason: "must be positive".to_string(),
            });
        }
        if let Some(idle) = self.pull_retry_idle_seconds {
            if idle as i64 <= self.lease_seconds {
                return Err(ConfigError::Invalid {
                    key: "PULL_RETRY_IDLE_SECONDS",
                    reason: format!("must exceed the step lease ({}s)", self.lease_seconds),
                });
            }
        }
        match self.dispatch_mode {
            DispatchMode::Push if self.push_queue_url.is_none() => {
                return Err(ConfigError::Missing {
                    key: "PUSH_QUEUE_URL",
                    when: "DISPATCH_MODE=push",
                });
            }
            DispatchMode::Pull if self.redis_url.is_none() => {
                return Err(ConfigError::Missing {
                    key: "REDIS_URL",
                    when: "DISPATCH_MODE=pull",
                });
            }
            _ => {}
        }
        if self.tasks_auth_required && self.tasks_auth_secret.is_none() {
            return Err(ConfigError::Missing {
                key: "TASKS_AUTH_SECRET",
                when: "TASKS_AUTH_REQUIRED=true",
            });
        }
        if self.use_persistent_stores && self.database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                when: "USE_PERSISTENT_STORES=true",
            });
        }
        Ok(())
    }
}

fn default_worker_name() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    format!("worker-{}", &id[id.len() - 8..])
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(raw: Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_to_inline_with_auth_secret() {
        let config = load(&[("TASKS_AUTH_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.dispatch_mode, DispatchMode::Inline);
        assert_eq!(config.lease_seconds, 300);
        assert_eq!(config.max_step_attempts, 5);
        assert!(config.tasks_auth_required);
    }

    #[test]
    fn lease_is_clamped_to_minimum() {
        let config = load(&[
            ("PIPELINE_STEP_LEASE_SECONDS", "1"),
            ("TASKS_AUTH_REQUIRED", "false"),
        ])
        .unwrap();
        assert_eq!(config.lease_seconds, MIN_LEASE_SECONDS);
    }

    #[test]
    fn push_mode_requires_queue_url() {
        let err = load(&[("DISPATCH_MODE", "push"), ("TASKS_AUTH_REQUIRED", "0")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "PUSH_QUEUE_URL",
                when: "DISPATCH_MODE=push"
            }
        );
    }

    #[test]
    fn rejects_garbage_values() {
        assert!(matches!(
            load(&[("DISPATCH_MODE", "carrier-pigeon")]),
            Err(ConfigError::Invalid { key: "DISPATCH_MODE", .. })
        ));
        assert!(matches!(
            load(&[("MAX_STEP_ATTEMPTS", "many"), ("TASKS_AUTH_REQUIRED", "no")]),
            Err(ConfigError::Invalid { key: "MAX_STEP_ATTEMPTS", .. })
        ));
    }

    #[test]
    fn trailing_slash_is_stripped_from_base_url() {
        let config = load(&[
            ("APP_BASE_URL", "https://routes.example.com/"),
            ("TASKS_AUTH_REQUIRED", "false"),
        ])
        .unwrap();
        assert_eq!(config.app_base_url, "https://routes.example.com");
    }

    #[test]
    fn pull_reclaim_idle_outlasts_the_lease() {
        let config = load(&[("PIPELINE_STEP_LEASE_SECONDS", "120"), ("TASKS_AUTH_REQUIRED", "false")]).unwrap();
        assert_eq!(config.pull_retry_idle(), Duration::from_secs(150));
        assert!(config.pull_retry_idle().as_secs() > config.lease_seconds as u64);

        let config = load(&[
            ("PIPELINE_STEP_LEASE_SECONDS", "60"),
            ("PULL_RETRY_IDLE_SECONDS", "600"),
            ("TASKS_AUTH_REQUIRED", "false"),
        ])
        .unwrap();
        assert_eq!(config.pull_retry_idle(), Duration::from_secs(600));

        let err = load(&[
            ("PIPELINE_STEP_LEASE_SECONDS", "300"),
            ("PULL_RETRY_IDLE_SECONDS", "30"),
            ("TASKS_AUTH_REQUIRED", "false"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PULL_RETRY_IDLE_SECONDS", .. }));
    }

    #[test]
    fn token_ttl_and_scheduler_switch() {
        let config = load(&[
            ("TASKS_TOKEN_TTL_SECONDS", "86400"),
            ("SCHEDULER_ENABLED", "true"),
            ("TASKS_AUTH_REQUIRED", "false"),
        ])
        .unwrap();
        assert_eq!(config.task_token_ttl_seconds, 86400);
        assert!(config.scheduler_enabled);

        let err = load(&[("TASKS_TOKEN_TTL_SECONDS", "0"), ("TASKS_AUTH_REQUIRED", "false")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TASKS_TOKEN_TTL_SECONDS", .. }));
    }
}
