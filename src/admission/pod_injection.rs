//! Pod disk-volume injection (§4.D "Pod mutation"). Parses the
//! `platform.apolo.us/inject-disk` annotation, validates the schema and
//! org/project consistency, and builds the volume+mount JSON Patch once
//! disks have been resolved to PVC names by the caller.

use crate::admission::patch::{self, add};
use crate::error::DiskError;
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct InjectionEntry {
    pub mount_path: String,
    pub disk_uri: String,
    #[serde(default = "default_mount_mode")]
    pub mount_mode: String,
}

fn default_mount_mode() -> String {
    "rw".to_string()
}

#[derive(Debug, Clone)]
pub struct DiskUri {
    pub cluster: String,
    pub org: String,
    pub project: String,
    pub id_or_name: String,
}

pub fn parse_injection_annotation(raw: &str) -> Result<Vec<InjectionEntry>, DiskError> {
    serde_json::from_str(raw)
        .map_err(|e| DiskError::Validation(format!("invalid {} annotation: {e}", crate::labels::INJECT_DISK_ANNOTATION)))
}

pub fn validate_entry(entry: &InjectionEntry) -> Result<(), DiskError> {
    if !entry.mount_path.starts_with('/') {
        return Err(DiskError::Validation(format!(
            "mount_path must be an absolute path: {:?}",
            entry.mount_path
        )));
    }
    if entry.mount_mode != "r" && entry.mount_mode != "rw" {
        return Err(DiskError::Validation(format!(
            "mount_mode must be \"r\" or \"rw\": {:?}",
            entry.mount_mode
        )));
    }
    parse_disk_uri(&entry.disk_uri)?;
    Ok(())
}

/// Parses `disk://<cluster>/<org>/<project>/<id-or-name>`.
pub fn parse_disk_uri(uri: &str) -> Result<DiskUri, DiskError> {
    let rest = uri
        .strip_prefix("disk://")
        .ok_or_else(|| DiskError::Validation(format!("invalid disk_uri: {uri:?}")))?;
    let parts: Vec<&str> = rest.splitn(4, '/').collect();
    let [cluster, org, project, id_or_name] = parts[..] else {
        return Err(DiskError::Validation(format!("invalid disk_uri: {uri:?}")));
    };
    if cluster.is_empty() || org.is_empty() || project.is_empty() || id_or_name.is_empty() {
        return Err(DiskError::Validation(format!("invalid disk_uri: {uri:?}")));
    }
    Ok(DiskUri {
        cluster: cluster.to_string(),
        org: org.to_string(),
        project: project.to_string(),
        id_or_name: id_or_name.to_string(),
    })
}

/// The org/project derived from (a) the disk URI, (b) the namespace
/// labels, and (c) the pod labels must each form a singleton set
/// (§4.D "Pod mutation" pre-conditions).
pub fn check_org_project_consistency(
    uri_org: &str,
    uri_project: &str,
    namespace_org: &str,
    namespace_project: &str,
    pod_org: &str,
    pod_project: &str,
) -> Result<(), DiskError> {
    let orgs: HashSet<&str> = [uri_org, namespace_org, pod_org].into_iter().collect();
    let projects: HashSet<&str> = [uri_project, namespace_project, pod_project].into_iter().collect();
    if orgs.len() != 1 || projects.len() != 1 {
        return Err(DiskError::Permission(
            "org/project mismatch between disk URI, namespace, and pod labels".to_string(),
        ));
    }
    Ok(())
}

pub fn generate_injected_volume_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("disk-auto-injected-volume-{}", &id[..8])
}

/// Builds the `add`-only patch for every resolved `(entry, pvc_name)`
/// pair: one `/spec/volumes` entry, and one `volumeMount` per container.
pub fn build_patch(pod: &Pod, resolved: &[(InjectionEntry, String)]) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let spec = pod.spec.as_ref();
    let containers_len = spec.map(|s| s.containers.len()).unwrap_or(0);

    let mut new_volumes = Vec::new();
    let mut container_mounts: Vec<Vec<serde_json::Value>> = vec![Vec::new(); containers_len];

    for (entry, pvc_name) in resolved {
        let volume_name = generate_injected_volume_name();
        let read_only = entry.mount_mode == "r";
        new_volumes.push(json!({
            "name": volume_name,
            "persistentVolumeClaim": { "claimName": pvc_name, "readOnly": read_only },
        }));
        for mounts in container_mounts.iter_mut() {
            mounts.push(json!({
                "name": volume_name,
                "mountPath": entry.mount_path,
                "readOnly": read_only,
            }));
        }
    }

    if new_volumes.is_empty() {
        return ops;
    }

    if spec.map(|s| s.volumes.is_some()).unwrap_or(false) {
        for volume in new_volumes {
            ops.push(add(patch::pointer(&["spec", "volumes", "-"]), volume));
        }
    } else {
        ops.push(add(patch::pointer(&["spec", "volumes"]), json!(new_volumes)));
    }

    for (i, mounts) in container_mounts.into_iter().enumerate() {
        if mounts.is_empty() {
            continue;
        }
        let idx = i.to_string();
        let has_mounts = spec
            .and_then(|s| s.containers.get(i))
            .map(|c| c.volume_mounts.is_some())
            .unwrap_or(false);
        if has_mounts {
            for mount in mounts {
                ops.push(add(
                    patch::pointer(&["spec", "containers", &idx, "volumeMounts", "-"]),
                    mount,
                ));
            }
        } else {
            ops.push(add(
                patch::pointer(&["spec", "containers", &idx, "volumeMounts"]),
                json!(mounts),
            ));
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn parses_valid_entry() {
        let raw = r#"[{"mount_path":"/mnt/d","disk_uri":"disk://c/acme/web/disk-abc"}]"#;
        let entries = parse_injection_annotation(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_mode, "rw");
        validate_entry(&entries[0]).unwrap();
    }

    #[test]
    fn rejects_relative_mount_path() {
        let raw = r#"[{"mount_path":"mnt/d","disk_uri":"disk://c/acme/web/disk-abc"}]"#;
        let entries = parse_injection_annotation(raw).unwrap();
        assert!(validate_entry(&entries[0]).is_err());
    }

    #[test]
    fn disk_uri_roundtrip() {
        let uri = parse_disk_uri("disk://cluster1/acme/web/disk-abc").unwrap();
        assert_eq!(uri.cluster, "cluster1");
        assert_eq!(uri.org, "acme");
        assert_eq!(uri.project, "web");
        assert_eq!(uri.id_or_name, "disk-abc");
    }

    #[test]
    fn consistency_requires_singleton_sets() {
        assert!(check_org_project_consistency("acme", "web", "acme", "web", "acme", "web").is_ok());
        assert!(check_org_project_consistency("acme", "web", "other", "web", "acme", "web").is_err());
    }

    #[test]
    fn build_patch_adds_volume_and_mount_per_container() {
        let pod = Pod {
            metadata: ObjectMeta::default(),
            spec: Some(PodSpec {
                containers: vec![Container { name: "main".to_string(), ..Default::default() }],
                ..Default::default()
            }),
            status: None,
        };
        let entry = InjectionEntry {
            mount_path: "/mnt/d".to_string(),
            disk_uri: "disk://c/acme/web/disk-abc".to_string(),
            mount_mode: "rw".to_string(),
        };
        let ops = build_patch(&pod, &[(entry, "disk-abc".to_string())]);
        assert_eq!(ops.len(), 2);
        let paths: Vec<&str> = ops.iter().map(|op| match op {
            PatchOperation::Add(a) => a.path.as_str(),
            _ => unreachable!(),
        }).collect();
        assert!(paths.contains(&"/spec/volumes"));
        assert!(paths.contains(&"/spec/containers/0/volumeMounts"));
    }
}
