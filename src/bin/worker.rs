use anyhow::Context;
use mailplane::{
    MailPlane, config::Config, connect_broker, connect_store, init_tracing, run_workers,
    shutdown_signal,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Queue-consuming side only: delivery workers and the queue monitor. Runs
/// next to one or more `app` front-ends against the same store and broker.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let store = connect_store(&config).await?;
    let broker = connect_broker(&config).await;

    let plane = MailPlane::assemble(config, store, broker);

    let shutdown = CancellationToken::new();
    run_workers(&plane, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping workers");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
