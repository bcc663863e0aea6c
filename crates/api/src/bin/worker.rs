//! Pull-mode worker: consumes the Redis task stream until Ctrl-C.

use anyhow::{Context, bail};

use fleetroute_infra::workers::{PullQueueWorker, PullWorkerConfig};
use fleetroute_infra::{DispatchMode, Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleetroute_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    if config.dispatch_mode != DispatchMode::Pull {
        bail!("fleetroute-worker needs DISPATCH_MODE=pull (got {})", config.dispatch_mode);
    }
    let worker_config = PullWorkerConfig::from_engine_config(&config);
    let engine = Engine::from_config(config).await.context("failed to build engine")?;
    let queue = engine
        .task_queue
        .clone()
        .context("pull dispatch did not open a task queue")?;

    let worker = PullQueueWorker::new(queue, engine.handler.clone(), worker_config).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    worker.shutdown().await;
    Ok(())
}
