use anyhow::{Context, Result};
use clap::Parser;
use disk_api::admission::{serve, AdmissionState};
use disk_api::config::AdmissionConfig;
use disk_api::gateway::KubeGateway;
use disk_api::service::DiskService;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AdmissionConfig::parse();

    info!("starting disk-admission-webhook");
    info!(enable_pod_injection = config.enable_pod_injection, "config loaded");

    let gateway = Arc::new(
        KubeGateway::new(config.kube.clone())
            .await
            .context("failed to build kube gateway")?,
    );
    let service = Arc::new(DiskService::new(gateway.clone(), config.disk.clone()));
    let state = Arc::new(AdmissionState {
        gateway,
        service,
        enable_pod_injection: config.enable_pod_injection,
    });

    serve(&config.server, state).await
}
