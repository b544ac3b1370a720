//! The one-shot namespace-migration job (§4.G): moves every managed PVC
//! out of a single legacy namespace into its derived per-project
//! namespace, preserving the underlying `PersistentVolume` when bound.

use crate::config::DiskConfig;
use crate::error::DiskError;
use crate::gateway::KubeGateway;
use crate::{labels, naming};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct MigrationJob {
    gateway: Arc<KubeGateway>,
    #[allow(dead_code)]
    disk_config: DiskConfig,
    legacy_namespace: String,
    pvc_delete_timeout: Duration,
}

impl MigrationJob {
    pub fn new(
        gateway: Arc<KubeGateway>,
        disk_config: DiskConfig,
        legacy_namespace: String,
        pvc_delete_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            disk_config,
            legacy_namespace,
            pvc_delete_timeout,
        }
    }

    /// Migrates every managed PVC in the legacy namespace. A per-PVC
    /// failure is logged and does not abort the remaining migrations.
    pub async fn run(&self) -> Result<(), DiskError> {
        let pvcs = self
            .gateway
            .list_pvcs(Some(&self.legacy_namespace), Some(labels::MARK.current))
            .await?;
        info!(count = pvcs.len(), namespace = %self.legacy_namespace, "starting namespace migration");

        for pvc in pvcs {
            let name = pvc.metadata.name.clone().unwrap_or_default();
            match self.migrate_one(&pvc).await {
                Ok(()) => info!(name = %name, "migration complete"),
                Err(e) => error!(name = %name, error = %e, "migration failed for PVC, continuing"),
            }
        }
        Ok(())
    }

    async fn migrate_one(&self, pvc: &PersistentVolumeClaim) -> Result<(), DiskError> {
        let name = pvc
            .metadata
            .name
            .clone()
            .ok_or_else(|| DiskError::Validation("PVC has no name".to_string()))?;

        if self.is_mounted(&name).await? {
            return Err(DiskError::DiskAlreadyInUse(format!(
                "PVC {name} is mounted by a running pod"
            )));
        }

        let (org, project) = resolve_org_project(pvc)?;
        let destination_namespace = naming::generate_namespace_name(&org, &project);
        self.gateway
            .ensure_project_namespace(&destination_namespace, &org, &project)
            .await?;
        info!(name = %name, destination = %destination_namespace, "destination namespace ready");

        let volume_name = pvc.spec.as_ref().and_then(|s| s.volume_name.clone());

        if let Some(pv_name) = &volume_name {
            self.gateway
                .patch_pv_merge(
                    pv_name,
                    serde_json::json!({ "spec": { "persistentVolumeReclaimPolicy": "Retain" } }),
                )
                .await?;
            info!(pv = %pv_name, "reclaim policy set to Retain");

            self.gateway.delete_pvc(&self.legacy_namespace, &name).await?;
            self.wait_for_pvc_gone(&name).await?;

            self.gateway
                .patch_pv_merge(pv_name, serde_json::json!({ "spec": { "claimRef": null } }))
                .await?;
            info!(pv = %pv_name, "claimRef cleared");
        }

        let new_pvc = build_destination_pvc(pvc, &destination_namespace, &org, &project);
        let created = self.gateway.create_pvc(&destination_namespace, &new_pvc).await?;
        info!(name = %name, destination = %destination_namespace, "PVC recreated");

        if let Some(pv_name) = &volume_name {
            self.wait_for_claim_ref(pv_name, &destination_namespace, &name).await?;
            self.gateway
                .patch_pv_merge(
                    pv_name,
                    serde_json::json!({ "spec": { "persistentVolumeReclaimPolicy": "Delete" } }),
                )
                .await?;
            info!(pv = %pv_name, "reclaim policy restored to Delete");
        }

        self.migrate_disk_naming(&created, &org, &project, &destination_namespace).await
    }

    async fn is_mounted(&self, pvc_name: &str) -> Result<bool, DiskError> {
        let (pods, _) = self.gateway.list_all_pods().await?;
        Ok(pods.iter().any(|pod| {
            pod.metadata.namespace.as_deref() == Some(self.legacy_namespace.as_str())
                && pod
                    .spec
                    .as_ref()
                    .map(|s| {
                        s.volumes.iter().flatten().any(|v| {
                            v.persistent_volume_claim
                                .as_ref()
                                .map(|src| src.claim_name == pvc_name)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
        }))
    }

    async fn wait_for_pvc_gone(&self, name: &str) -> Result<(), DiskError> {
        let deadline = tokio::time::Instant::now() + self.pvc_delete_timeout;
        loop {
            match self.gateway.get_pvc(&self.legacy_namespace, name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(DiskError::Transient(format!(
                        "PVC {name} did not disappear within the migration delete timeout"
                    )));
                }
                Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    async fn wait_for_claim_ref(&self, pv_name: &str, namespace: &str, pvc_name: &str) -> Result<(), DiskError> {
        let deadline = tokio::time::Instant::now() + self.pvc_delete_timeout;
        loop {
            let pv = self.gateway.get_pv(pv_name).await?;
            let matches = pv
                .spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .map(|r| r.name.as_deref() == Some(pvc_name) && r.namespace.as_deref() == Some(namespace))
                .unwrap_or(false);
            if matches {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DiskError::Transient(format!(
                    "PV {pv_name} claimRef did not update within the migration timeout"
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn migrate_disk_naming(
        &self,
        new_pvc: &PersistentVolumeClaim,
        org: &str,
        project: &str,
        destination_namespace: &str,
    ) -> Result<(), DiskError> {
        let Some(disk_name) = new_pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| labels::NAME.read(a))
            .map(str::to_string)
        else {
            return Ok(());
        };

        let naming_name = naming::get_disk_naming_name(&disk_name, org, project);
        match self.gateway.delete_disk_naming(&self.legacy_namespace, &naming_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(name = %naming_name, error = %e, "failed to delete legacy DiskNaming"),
        }

        let pvc_name = new_pvc.metadata.name.clone().unwrap_or_default();
        self.gateway
            .create_disk_naming(destination_namespace, &naming_name, &pvc_name)
            .await?;
        Ok(())
    }
}

fn resolve_org_project(pvc: &PersistentVolumeClaim) -> Result<(String, String), DiskError> {
    let labels_map = pvc.metadata.labels.as_ref();
    let org = labels_map.and_then(|l| labels::ORG.read(l)).map(str::to_string);
    let project = labels_map.and_then(|l| labels::PROJECT.read(l)).map(str::to_string);
    if let (Some(org), Some(project)) = (&org, &project) {
        return Ok((org.clone(), project.clone()));
    }

    // Fall back to splitting the user label by "--" (§4.G step 1).
    let user = labels_map.and_then(|l| labels::USER.read(l)).ok_or_else(|| {
        DiskError::Validation("PVC has neither org/project labels nor a user label to derive them from".to_string())
    })?;
    let mut parts = user.splitn(2, "--");
    let fallback_org = parts.next().unwrap_or_default().to_string();
    let fallback_project = parts.next().unwrap_or_default().to_string();
    Ok((org.unwrap_or(fallback_org), project.unwrap_or(fallback_project)))
}

fn build_destination_pvc(
    legacy: &PersistentVolumeClaim,
    destination_namespace: &str,
    org: &str,
    project: &str,
) -> PersistentVolumeClaim {
    let legacy_spec = legacy.spec.clone().unwrap_or_default();
    let owner = legacy
        .metadata
        .labels
        .as_ref()
        .and_then(|l| labels::USER.read(l))
        .map(labels::owner_from_label_value)
        .unwrap_or_default();

    let mut annotations = std::collections::BTreeMap::new();
    if let Some(existing) = &legacy.metadata.annotations {
        for pair in [
            labels::CREATED_AT,
            labels::LAST_USAGE,
            labels::LIFE_SPAN,
            labels::USED_BYTES,
            labels::NAME,
        ] {
            if let Some(value) = pair.read(existing) {
                pair.write(&mut annotations, value.to_string());
            }
        }
    }
    let labels_map = crate::disk::build_labels(&owner, org, project);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: legacy.metadata.name.clone(),
            namespace: Some(destination_namespace.to_string()),
            uid: legacy.metadata.uid.clone(),
            labels: Some(labels_map),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(legacy_spec),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as Meta;

    fn legacy_pvc(org: Option<&str>, project: Option<&str>, user: Option<&str>) -> PersistentVolumeClaim {
        let mut labels = std::collections::BTreeMap::new();
        if let Some(org) = org {
            labels::ORG.write(&mut labels, org);
        }
        if let Some(project) = project {
            labels::PROJECT.write(&mut labels, project);
        }
        if let Some(user) = user {
            labels::USER.write(&mut labels, user);
        }
        PersistentVolumeClaim {
            metadata: Meta {
                name: Some("disk-legacy".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn resolve_org_project_prefers_explicit_labels() {
        let pvc = legacy_pvc(Some("acme"), Some("web"), Some("alice--acme--web"));
        let (org, project) = resolve_org_project(&pvc).unwrap();
        assert_eq!(org, "acme");
        assert_eq!(project, "web");
    }

    #[test]
    fn resolve_org_project_falls_back_to_user_label() {
        let pvc = legacy_pvc(None, None, Some("acme--web"));
        let (org, project) = resolve_org_project(&pvc).unwrap();
        assert_eq!(org, "acme");
        assert_eq!(project, "web");
    }

    #[test]
    fn resolve_org_project_requires_some_source() {
        let pvc = legacy_pvc(None, None, None);
        assert!(resolve_org_project(&pvc).is_err());
    }
}
