//! The disk service (§4.C): orchestrates `DiskNaming` + PVC creation,
//! lookup, removal, and usage bookkeeping on top of [`crate::gateway`].
//!
//! Coverage for this module lives in `tests/integration_test.rs` against a
//! real k3s cluster (scenarios S1-S6) rather than as `#[cfg(test)]` unit
//! tests: every operation here is a sequence of K8s API calls, so there is
//! nothing meaningful to assert without one.

use crate::config::DiskConfig;
use crate::disk::{self, Disk, DiskRequest};
use crate::error::DiskError;
use crate::gateway::KubeGateway;
use crate::{labels, naming};
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct DiskService {
    gateway: Arc<KubeGateway>,
    config: DiskConfig,
}

impl DiskService {
    pub fn new(gateway: Arc<KubeGateway>, config: DiskConfig) -> Self {
        Self { gateway, config }
    }

    /// Creates a disk: resolves the project namespace, enforces the
    /// per-project storage quota, creates the `DiskNaming` (if a name was
    /// requested) before the PVC, and compensates by deleting the
    /// `DiskNaming` if PVC creation fails (§4.C ordering invariant).
    pub async fn create_disk(&self, owner: &str, request: DiskRequest) -> Result<Disk, DiskError> {
        if let Some(name) = &request.name {
            disk::validate_disk_name(name)?;
        }
        let org_name = labels::normalize_org(request.org_name.as_deref());
        let project_name = request.project_name.clone();
        let namespace_name = naming::generate_namespace_name(&org_name, &project_name);

        self.gateway
            .ensure_project_namespace(&namespace_name, &org_name, &project_name)
            .await?;
        self.check_quota(&namespace_name, request.storage).await?;

        let disk_id = format!("disk-{}", Uuid::new_v4());
        let created_at = Utc::now();

        let naming_name = request
            .name
            .as_ref()
            .map(|n| naming::get_disk_naming_name(n, &org_name, &project_name));

        if let Some(naming_name) = &naming_name {
            if self
                .gateway
                .get_disk_naming(&namespace_name, naming_name)
                .await
                .is_ok()
            {
                return Err(DiskError::DiskNameUsed(request.name.clone().unwrap()));
            }
            self.gateway
                .create_disk_naming(&namespace_name, naming_name, &disk_id)
                .await
                .map_err(|e| match e {
                    DiskError::Conflict(_) => {
                        DiskError::DiskNameUsed(request.name.clone().unwrap())
                    }
                    other => other,
                })?;
        }

        let storage_class_name = self.resolve_storage_class().await?;
        let labels_map = disk::build_labels(owner, &org_name, &project_name);
        let annotations = disk::build_annotations(created_at, request.life_span, request.name.as_deref());

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(disk_id.clone()),
                namespace: Some(namespace_name.clone()),
                labels: Some(labels_map),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(storage_class_name),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity(request.storage.to_string()))].into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };

        let created = match self.gateway.create_pvc(&namespace_name, &pvc).await {
            Ok(p) => p,
            Err(e) => {
                if let Some(naming_name) = &naming_name {
                    info!(%naming_name, "compensating: deleting DiskNaming after PVC create failure");
                    let _ = self
                        .gateway
                        .delete_disk_naming(&namespace_name, naming_name)
                        .await;
                }
                return Err(e);
            }
        };

        disk::pvc_to_disk(&created)
    }

    pub async fn get_disk(&self, namespace: &str, id: &str) -> Result<Disk, DiskError> {
        let pvc = self.gateway.get_pvc(namespace, id).await?;
        self.to_disk_with_backfill(namespace, pvc).await
    }

    pub async fn get_disk_by_name(
        &self,
        namespace: &str,
        org: &str,
        project: &str,
        name: &str,
    ) -> Result<Disk, DiskError> {
        let naming_name = naming::get_disk_naming_name(name, org, project);
        let naming = self.gateway.get_disk_naming(namespace, &naming_name).await?;
        self.get_disk(namespace, &naming.spec.disk_id).await
    }

    /// Lists live (managed, non-deleted) disks. Namespace-scoped when
    /// `namespace` is given, cluster-wide otherwise (§4.C "get_all_disks").
    pub async fn get_all_disks(&self, namespace: Option<&str>) -> Result<Vec<Disk>, DiskError> {
        let pvcs = self
            .gateway
            .list_pvcs(namespace, Some(labels::MARK.current))
            .await?;
        pvcs.into_iter()
            .filter(|p| !is_deleted(p))
            .map(|p| disk::pvc_to_disk(&p))
            .collect()
    }

    /// Deletes a disk in the order DiskNaming -> deleted-mark patch ->
    /// PVC delete, so a crash mid-removal never leaves a name claimed by a
    /// PVC that is already gone, and an observer sees the deleted mark
    /// before the PVC disappears (§4.C, §5 lifecycle).
    pub async fn remove_disk(&self, namespace: &str, id: &str) -> Result<(), DiskError> {
        let pvc = self.gateway.get_pvc(namespace, id).await?;
        let disk = disk::pvc_to_disk(&pvc)?;

        if let Some(name) = &disk.name {
            let naming_name = naming::get_disk_naming_name(name, &disk.org_name, &disk.project_name);
            match self.gateway.delete_disk_naming(namespace, &naming_name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut deleted_labels = std::collections::BTreeMap::new();
        labels::DELETED_MARK.write(&mut deleted_labels, "true");
        let patch = serde_json::json!({ "metadata": { "labels": deleted_labels } });
        self.gateway.patch_pvc_merge(namespace, id, patch).await?;

        match self.gateway.delete_pvc(namespace, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stamps `last_usage` with the current time (§4.E pod-usage watcher).
    pub async fn mark_disk_usage(&self, namespace: &str, id: &str) -> Result<(), DiskError> {
        let now = disk::dump_timestamp(Utc::now());
        let annotations = dual_annotation_patch(labels::LAST_USAGE, &now);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.gateway.patch_pvc_merge(namespace, id, patch).await?;
        Ok(())
    }

    /// Records the latest byte-usage sample (§4.E byte-usage sampler).
    pub async fn update_disk_used_bytes(
        &self,
        namespace: &str,
        id: &str,
        used_bytes: i64,
    ) -> Result<(), DiskError> {
        let value = used_bytes.to_string();
        let annotations = dual_annotation_patch(labels::USED_BYTES, &value);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.gateway.patch_pvc_merge(namespace, id, patch).await?;
        Ok(())
    }

    async fn to_disk_with_backfill(
        &self,
        namespace: &str,
        pvc: PersistentVolumeClaim,
    ) -> Result<Disk, DiskError> {
        let has_created_at = pvc
            .metadata
            .annotations
            .as_ref()
            .map(|a| labels::CREATED_AT.is_present(a))
            .unwrap_or(false);
        if has_created_at {
            return disk::pvc_to_disk(&pvc);
        }
        let name = pvc
            .metadata
            .name
            .clone()
            .ok_or_else(|| DiskError::Validation("PVC has no name".to_string()))?;
        let now = disk::dump_timestamp(Utc::now());
        let annotations = dual_annotation_patch(labels::CREATED_AT, &now);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        let patched = self.gateway.patch_pvc_merge(namespace, &name, patch).await?;
        disk::pvc_to_disk(&patched)
    }

    pub async fn resolve_storage_class(&self) -> Result<String, DiskError> {
        if !self.config.storage_class_name.is_empty() {
            return Ok(self.config.storage_class_name.clone());
        }
        let sc = self.gateway.default_storage_class().await?;
        sc.and_then(|s| s.metadata.name).ok_or_else(|| {
            DiskError::Fatal("no default StorageClass found and none configured".to_string())
        })
    }

    async fn check_quota(&self, namespace: &str, requested: i64) -> Result<(), DiskError> {
        let disks = self.get_all_disks(Some(namespace)).await?;
        let used: i64 = disks.iter().map(|d| d.storage_requested).sum();
        let available = self.config.storage_limit_per_project.saturating_sub(used);
        if requested > available {
            return Err(DiskError::QuotaExceeded {
                requested,
                available,
            });
        }
        Ok(())
    }
}

fn is_deleted(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .labels
        .as_ref()
        .map(|l| labels::DELETED_MARK.is_present(l))
        .unwrap_or(false)
}

fn dual_annotation_patch(pair: labels::KeyPair, value: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert(pair.legacy.to_string(), serde_json::json!(value));
    m.insert(pair.current.to_string(), serde_json::json!(value));
    m
}
