use anyhow::Context;
use mailplane::{
    MailPlane, config::Config, connect_broker, connect_store, init_tls, init_tracing, run_mta,
    shutdown_signal,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    init_tls();

    let config = Config::from_env().context("invalid configuration")?;
    let store = connect_store(&config).await?;
    let broker = connect_broker(&config).await;

    let plane = MailPlane::assemble(config, store, broker);
    plane
        .bootstrap_primary_domain()
        .await
        .context("failed to provision the primary domain")?;

    let shutdown = CancellationToken::new();
    run_mta(plane, shutdown.clone()).await;

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
