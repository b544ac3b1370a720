use anyhow::{Context, Result};
use clap::Parser;
use disk_api::config::MigrationConfig;
use disk_api::gateway::KubeGateway;
use disk_api::migration::MigrationJob;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = MigrationConfig::parse();

    info!(legacy_namespace = %config.legacy_namespace, "starting disk-namespace-migration");

    let gateway = Arc::new(
        KubeGateway::new(config.kube.clone())
            .await
            .context("failed to build kube gateway")?,
    );
    let job = MigrationJob::new(
        gateway,
        config.disk.clone(),
        config.legacy_namespace.clone(),
        Duration::from_secs(config.pvc_delete_timeout_secs),
    );

    job.run().await.context("namespace migration job failed")
}
