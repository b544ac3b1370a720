use anyhow::{Context, Result};
use clap::Parser;
use disk_api::config::ProjectEventsConfig;
use disk_api::gateway::KubeGateway;
use disk_api::project_events::{run, HttpEventsClient};
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

    let config = ProjectEventsConfig::parse();

    let Some(url) = config.events.url.clone() else {
        info!("EVENTS_URL unset, project-event consumer disabled");
        return Ok(());
    };

    info!(consumer = %config.events.name, "starting disk-project-events");

    let gateway = Arc::new(
        KubeGateway::new(config.kube.clone())
            .await
            .context("failed to build kube gateway")?,
    );
    let service = Arc::new(DiskService::new(gateway, config.disk.clone()));
    let client = Arc::new(HttpEventsClient::new(
        url,
        config.events.token.clone(),
        "platform-admin".to_string(),
    )?);

    run(client, service).await;
    Ok(())
}
