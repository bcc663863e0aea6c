use anyhow::Context;

use fleetroute_infra::scheduler::{JobScheduler, ml_maintenance};
use fleetroute_infra::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleetroute_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();
    let engine = Engine::from_config(config).await.context("failed to build engine")?;

    let scheduler = engine.config.scheduler_enabled.then(|| {
        JobScheduler::new(engine.service.clone(), engine.clock.clone(), ml_maintenance()).spawn()
    });

    let app = fleetroute_api::app::build_app(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    Ok(())
}
