use anyhow::{Context, Result};
use clap::Parser;
use disk_api::config::UsageWatcherConfig;
use disk_api::gateway::KubeGateway;
use disk_api::service::DiskService;
use disk_api::usage_watcher::{watch_disk_usage, watch_lifespan_ended, watch_used_bytes};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = UsageWatcherConfig::parse();

    info!("starting disk-usage-watcher");
    info!(
        used_bytes_interval_secs = config.used_bytes_interval_secs,
        lifespan_sweep_interval_secs = config.lifespan_sweep_interval_secs,
        "config loaded"
    );

    let gateway = Arc::new(
        KubeGateway::new(config.kube.clone())
            .await
            .context("failed to build kube gateway")?,
    );
    let service = Arc::new(DiskService::new(gateway.clone(), config.disk.clone()));

    // Each loop restarts itself on error (§4.E). The three run as members of
    // one `JoinSet`, so dropping or aborting the set tears down all three as
    // a single unit (§5 concurrency contract) rather than three independent
    // runtime tasks a caller would have to cancel one by one.
    let mut tasks = JoinSet::new();
    tasks.spawn(watch_disk_usage(gateway.clone(), service.clone()));
    tasks.spawn(watch_used_bytes(
        gateway,
        service.clone(),
        Duration::from_secs(config.used_bytes_interval_secs),
    ));
    tasks.spawn(watch_lifespan_ended(
        service,
        Duration::from_secs(config.lifespan_sweep_interval_secs),
    ));

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tasks.abort_all();
            return Err(e).context("usage watcher task panicked");
        }
    }
    Ok(())
}
