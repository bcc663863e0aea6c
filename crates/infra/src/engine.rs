//! Wiring: builds the store, lease manager, dispatcher, runner, handler and
//! service from an [`EngineConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, InMemoryArtifactStore, LocalArtifactStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, DispatchMode, EngineConfig};
use crate::dispatch::{EnqueueError, InlineDispatcher, PushQueueDispatcher, QueueDispatcher};
use crate::executors::{ExecutorRegistry, http_registry};
use crate::jobs::{InMemoryJobRecordStore, JobRecordStore, JobRecords, JobStoreError, PostgresJobRecordStore, StepLeaseManager};
use crate::pipeline::PipelineRunner;
use crate::service::JobService;
use crate::stats::EngineStats;
use crate::task_auth::TaskTokens;
use crate::task_handler::TaskHandler;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Dispatch(#[from] EnqueueError),

    #[error("{0} requires the `redis` feature")]
    FeatureDisabled(&'static str),
}

/// Fully wired engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub records: Arc<JobRecords>,
    pub leases: Arc<StepLeaseManager>,
    pub dispatcher: Arc<dyn QueueDispatcher>,
    pub handler: Arc<TaskHandler>,
    pub service: Arc<JobService>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub stats: Arc<EngineStats>,
    pub clock: Arc<dyn Clock>,
    /// Set when task deliveries must carry a bearer token.
    pub task_tokens: Option<TaskTokens>,
    #[cfg(feature = "redis")]
    pub task_queue: Option<Arc<crate::dispatch::RedisTaskQueue>>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobRecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    registry: Option<ExecutorRegistry>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    dispatcher: Option<Arc<dyn QueueDispatcher>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            registry: None,
            artifacts: None,
            dispatcher: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Replace the configured transport (tests, custom queues).
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn QueueDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let stats = Arc::new(EngineStats::default());

        let store: Arc<dyn JobRecordStore> = match self.store {
            Some(store) => store,
            None => match (&config.database_url, config.use_persistent_stores) {
                (Some(url), true) => {
                    let store = PostgresJobRecordStore::connect(url).await?;
                    store.migrate().await?;
                    info!("using postgres job record store");
                    Arc::new(store)
                }
                _ => InMemoryJobRecordStore::arc(),
            },
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => match &config.executor_base_url {
                Some(base) => http_registry(reqwest::Client::new(), base),
                None => {
                    warn!("EXECUTOR_BASE_URL not set; no job types can be submitted");
                    ExecutorRegistry::new()
                }
            },
        };
        let registry = Arc::new(registry);

        let artifacts: Arc<dyn ArtifactStore> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => match &config.artifact_dir {
                Some(dir) => Arc::new(LocalArtifactStore::new(dir.clone())),
                None => Arc::new(InMemoryArtifactStore::new()),
            },
        };

        let task_tokens = config
            .tasks_auth_secret
            .as_deref()
            .map(|secret| {
                TaskTokens::new(secret, config.tasks_audience.clone())
                    .with_ttl_seconds(config.task_token_ttl_seconds)
            });

        #[cfg(feature = "redis")]
        let mut task_queue = None;
        let mut inline = None;
        let dispatcher: Arc<dyn QueueDispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => match config.dispatch_mode {
                DispatchMode::Push => Arc::new(PushQueueDispatcher::from_config(&config, clock.clone())?),
                #[cfg(feature = "redis")]
                DispatchMode::Pull => {
                    let url = config.redis_url.as_deref().ok_or(EnqueueError::NotConfigured {
                        mode: DispatchMode::Pull,
                        detail: "REDIS_URL is not set".to_string(),
                    })?;
                    let queue = crate::dispatch::RedisTaskQueue::open(url, config.pull_queue_stream.clone())
                        .map_err(|e| EnqueueError::NotConfigured {
                            mode: DispatchMode::Pull,
                            detail: e.to_string(),
                        })?;
                    let queue = Arc::new(queue);
                    task_queue = Some(queue.clone());
                    Arc::new(crate::dispatch::PullQueueDispatcher::new(queue))
                }
                #[cfg(not(feature = "redis"))]
                DispatchMode::Pull => return Err(EngineError::FeatureDisabled("DISPATCH_MODE=pull")),
                DispatchMode::Inline => {
                    let dispatcher = Arc::new(InlineDispatcher::new(config.inline_max_deliveries));
                    inline = Some(dispatcher.clone());
                    dispatcher
                }
            },
        };

        let records = Arc::new(JobRecords::new(store, clock.clone()));
        let leases = Arc::new(StepLeaseManager::new(records.clone(), config.lease_seconds, stats.clone()));
        let runner = Arc::new(
            PipelineRunner::new(
                leases.clone(),
                dispatcher.clone(),
                registry.clone(),
                artifacts.clone(),
                stats.clone(),
            )
            .with_max_step_attempts(config.max_step_attempts)
            .with_worker_name(config.worker_name.clone())
            .with_latency_warning(Duration::from_secs(config.latency_warn_seconds)),
        );
        let handler = Arc::new(
            TaskHandler::new(runner, leases.clone(), registry.clone(), artifacts.clone(), stats.clone())
                .with_max_attempts(config.max_step_attempts)
                .with_worker_name(config.worker_name.clone()),
        );
        if let Some(inline) = inline {
            inline.bind(&handler);
        }
        let service = Arc::new(JobService::new(records.clone(), dispatcher.clone(), registry, stats.clone()));

        info!(
            dispatch_mode = %dispatcher.mode(),
            lease_seconds = config.lease_seconds,
            worker = %config.worker_name,
            "engine ready"
        );

        Ok(Engine {
            config: Arc::new(config),
            records,
            leases,
            dispatcher,
            handler,
            service,
            artifacts,
            stats,
            clock,
            task_tokens,
            #[cfg(feature = "redis")]
            task_queue,
        })
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build().await
    }
}
