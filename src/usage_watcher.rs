//! The usage watcher (§4.E): three cooperating, independently restartable
//! loops. Each loop catches and logs every error so a transient cluster
//! hiccup never takes down the process.

use crate::gateway::KubeGateway;
use crate::service::DiskService;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn pod_pvc_pairs(pod: &Pod) -> Vec<(String, String)> {
    let Some(namespace) = pod.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    pod.spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|src| (namespace.to_string(), src.claim_name.clone()))
        .collect()
}

async fn mark_all(service: &DiskService, pod: &Pod) {
    for (namespace, claim_name) in pod_pvc_pairs(pod) {
        if let Err(e) = service.mark_disk_usage(&namespace, &claim_name).await {
            if !e.is_not_found() {
                warn!(namespace, name = %claim_name, error = %e, "failed to mark disk usage");
            }
        }
    }
}

/// Maintains `last_usage` on every PVC mounted by a running pod. Restarts
/// from a fresh list+watch cycle on any stream failure, including 410 Gone.
pub async fn watch_disk_usage(gateway: Arc<KubeGateway>, service: Arc<DiskService>) {
    loop {
        if let Err(e) = run_disk_usage_cycle(&gateway, &service).await {
            error!(error = %e, "watch_disk_usage cycle failed, restarting from a fresh list");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run_disk_usage_cycle(
    gateway: &KubeGateway,
    service: &DiskService,
) -> Result<(), crate::error::DiskError> {
    let (pods, mut resource_version) = gateway.list_all_pods().await?;
    info!(count = pods.len(), "watch_disk_usage: initial pod list");
    for pod in &pods {
        mark_all(service, pod).await;
    }

    let stream = gateway.watch_all_pods(&resource_version).await?;
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                mark_all(service, &pod).await;
            }
            Ok(WatchEvent::Deleted(_)) => {}
            Ok(WatchEvent::Bookmark(bookmark)) => {
                resource_version = bookmark.metadata.resource_version;
            }
            Ok(WatchEvent::Error(e)) => {
                if e.code == 410 {
                    info!("pod watch resource version gone, re-listing");
                    return Ok(());
                }
                warn!(code = e.code, message = %e.message, "pod watch error event");
            }
            Err(e) => warn!(error = %e, "pod watch stream error, continuing"),
        }
    }

    info!("pod watch stream ended, re-listing");
    Ok(())
}

/// Every `interval`, scrapes every node's kubelet stats-summary and records
/// the latest per-volume byte usage.
pub async fn watch_used_bytes(gateway: Arc<KubeGateway>, service: Arc<DiskService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = run_used_bytes_cycle(&gateway, &service).await {
            error!(error = %e, "watch_used_bytes iteration failed");
        }
    }
}

async fn run_used_bytes_cycle(
    gateway: &KubeGateway,
    service: &DiskService,
) -> Result<(), crate::error::DiskError> {
    let nodes = gateway.list_nodes().await?;
    for node in nodes {
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        let samples = match gateway.get_stats_summary(&name).await {
            Ok(s) => s,
            Err(e) => {
                warn!(node = %name, error = %e, "failed to scrape node stats-summary");
                continue;
            }
        };
        for sample in samples {
            let result = service
                .update_disk_used_bytes(&sample.pvc_namespace, &sample.pvc_name, sample.used_bytes)
                .await;
            if let Err(e) = result {
                if !e.is_not_found() {
                    warn!(
                        namespace = %sample.pvc_namespace,
                        name = %sample.pvc_name,
                        error = %e,
                        "failed to update used bytes"
                    );
                }
            }
        }
    }
    Ok(())
}

/// Every `interval`, removes every live disk whose lifespan has elapsed
/// since its last usage (or creation, if never used).
pub async fn watch_lifespan_ended(service: Arc<DiskService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = run_lifespan_sweep(&service).await {
            error!(error = %e, "watch_lifespan_ended sweep failed");
        }
    }
}

async fn run_lifespan_sweep(service: &DiskService) -> Result<(), crate::error::DiskError> {
    let disks = service.get_all_disks(None).await?;
    let now = Utc::now();
    for disk in disks {
        let Some(life_span) = disk.life_span else {
            continue;
        };
        let anchor = disk.last_usage.unwrap_or(disk.created_at);
        let deadline = anchor + life_span;
        if now <= deadline {
            continue;
        }
        let namespace = crate::naming::generate_namespace_name(&disk.org_name, &disk.project_name);
        info!(namespace, id = %disk.id, "lifespan elapsed, removing disk");
        if let Err(e) = service.remove_disk(&namespace, &disk.id).await {
            if !e.is_not_found() {
                warn!(namespace, id = %disk.id, error = %e, "failed to remove expired disk");
            }
        }
    }
    Ok(())
}
