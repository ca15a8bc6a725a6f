use anyhow::Context;

use vidflow_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vidflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let stores = vidflow_daemon::app::open_stores(&config).await?;
    let running = vidflow_daemon::app::start(&config, stores).await?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    running.shutdown().await;
    tracing::info!("stopped");
    Ok(())
}
