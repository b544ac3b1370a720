//! Domain types: `Disk`, `DiskRequest`, and the PVC <-> Disk translation
//! rules (§3, §4.C).

use crate::labels::{self, KeyPair};
use crate::quantity::parse_quantity_bytes;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskStatus {
    Pending,
    Ready,
    Broken,
}

#[derive(Debug, Clone)]
pub struct DiskRequest {
    pub storage: i64,
    pub org_name: Option<String>,
    pub project_name: String,
    pub life_span: Option<chrono::Duration>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub id: String,
    pub storage_requested: i64,
    pub storage_real: Option<i64>,
    pub owner: String,
    pub org_name: String,
    pub project_name: String,
    pub name: Option<String>,
    pub status: DiskStatus,
    pub created_at: DateTime<Utc>,
    pub last_usage: Option<DateTime<Utc>>,
    pub life_span: Option<chrono::Duration>,
    pub used_bytes: Option<i64>,
}

/// `name` must match `^[a-z](-?[a-z0-9])*$`, length 3-40.
pub fn validate_disk_name(name: &str) -> Result<(), crate::error::DiskError> {
    if name.len() < 3 || name.len() > 40 {
        return Err(crate::error::DiskError::Validation(format!(
            "disk name {name:?} must be 3-40 characters"
        )));
    }
    static NAME_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z](-?[a-z0-9])*$").unwrap());
    if !re.is_match(name) {
        return Err(crate::error::DiskError::Validation(format!(
            "disk name {name:?} does not match ^[a-z](-?[a-z0-9])*$"
        )));
    }
    Ok(())
}

/// Serializes a timestamp the way `original_source/platform_disk_api/utils.py`
/// does: the string form of a Unix epoch float (`str(dt.timestamp())`).
pub fn dump_timestamp(dt: DateTime<Utc>) -> String {
    let micros = dt.timestamp_subsec_micros();
    format!("{}.{:06}", dt.timestamp(), micros)
}

pub fn load_timestamp(raw: &str) -> Result<DateTime<Utc>, crate::error::DiskError> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| crate::error::DiskError::Validation(format!("bad timestamp: {raw:?}")))?;
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds.fract()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, nanos)
        .single()
        .ok_or_else(|| crate::error::DiskError::Validation(format!("bad timestamp: {raw:?}")))
}

pub fn dump_life_span(d: chrono::Duration) -> String {
    d.num_seconds().to_string()
}

pub fn load_life_span(raw: &str) -> Result<chrono::Duration, crate::error::DiskError> {
    let secs: i64 = raw
        .parse()
        .map_err(|_| crate::error::DiskError::Validation(format!("bad life_span: {raw:?}")))?;
    Ok(chrono::Duration::seconds(secs))
}

/// Builds the annotation map (both legacy and apolo keys) for a new PVC.
pub fn build_annotations(
    created_at: DateTime<Utc>,
    life_span: Option<chrono::Duration>,
    name: Option<&str>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    labels::CREATED_AT.write(&mut annotations, dump_timestamp(created_at));
    if let Some(ls) = life_span {
        labels::LIFE_SPAN.write(&mut annotations, dump_life_span(ls));
    }
    if let Some(n) = name {
        labels::NAME.write(&mut annotations, n.to_string());
    }
    annotations
}

/// Builds the label map (both legacy and apolo keys) for a new PVC.
pub fn build_labels(owner: &str, org_name: &str, project_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels::MARK.write(&mut labels, "true");
    labels::ORG.write(&mut labels, org_name);
    labels::PROJECT.write(&mut labels, project_name);
    labels::USER.write(&mut labels, labels::owner_to_label_value(owner));
    labels
}

fn read_pair(map: Option<&BTreeMap<String, String>>, pair: KeyPair) -> Option<String> {
    map.and_then(|m| pair.read(m)).map(str::to_string)
}

/// Translates a `PersistentVolumeClaim` API object into a `Disk`.
/// If the `created_at` annotation is missing, the caller is responsible
/// for back-filling it before calling this (see `DiskService::get_disk`
/// in `service.rs`, which performs the merge-patch).
pub fn pvc_to_disk(pvc: &PersistentVolumeClaim) -> Result<Disk, crate::error::DiskError> {
    let meta = &pvc.metadata;
    let labels_map = meta.labels.as_ref();
    let annotations_map = meta.annotations.as_ref();

    let pvc_name = meta
        .name
        .clone()
        .ok_or_else(|| crate::error::DiskError::Validation("PVC has no name".to_string()))?;

    let id = annotations_map
        .and_then(|a| a.get(labels::VCLUSTER_OBJECT_NAME_ANNOTATION))
        .cloned()
        .unwrap_or(pvc_name);

    let owner = read_pair(labels_map, labels::USER)
        .map(|v| labels::owner_from_label_value(&v))
        .unwrap_or_default();
    let org_name = read_pair(labels_map, labels::ORG).unwrap_or_else(|| labels::NO_ORG_SENTINEL.to_string());
    let project_name = read_pair(labels_map, labels::PROJECT).unwrap_or_default();
    let name = read_pair(annotations_map, labels::NAME);

    let created_at = match read_pair(annotations_map, labels::CREATED_AT) {
        Some(raw) => load_timestamp(&raw)?,
        None => Utc::now(),
    };
    let last_usage = read_pair(annotations_map, labels::LAST_USAGE)
        .map(|raw| load_timestamp(&raw))
        .transpose()?;
    let life_span = read_pair(annotations_map, labels::LIFE_SPAN)
        .map(|raw| load_life_span(&raw))
        .transpose()?;
    let used_bytes = read_pair(annotations_map, labels::USED_BYTES)
        .and_then(|raw| raw.parse::<i64>().ok());

    let spec = pvc.spec.as_ref();
    let storage_requested = spec
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(parse_quantity_bytes)
        .transpose()?
        .map(saturate_i64)
        .unwrap_or(0);

    let status_phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    let storage_real = pvc
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(parse_quantity_bytes)
        .transpose()?
        .map(saturate_i64);

    let status = match status_phase {
        Some("Bound") => DiskStatus::Ready,
        Some("Lost") => DiskStatus::Broken,
        _ => DiskStatus::Pending,
    };

    Ok(Disk {
        id,
        storage_requested,
        storage_real,
        owner,
        org_name,
        project_name,
        name,
        status,
        created_at,
        last_usage,
        life_span,
        used_bytes,
    })
}

fn saturate_i64(v: i128) -> i64 {
    v.clamp(0, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn make_pvc(
        name: &str,
        storage_requested: &str,
        storage_real: Option<&str>,
        phase: Option<&str>,
        owner: &str,
        org: &str,
        project: &str,
        disk_name: Option<&str>,
        created_at: Option<DateTime<Utc>>,
    ) -> PersistentVolumeClaim {
        let labels = build_labels(owner, org, project);
        let annotations = build_annotations(created_at.unwrap_or_else(Utc::now), None, disk_name);

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("platform--acme--web--abc".to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("platform-disk".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity(storage_requested.to_string()))].into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: phase.map(str::to_string),
                capacity: storage_real.map(|s| {
                    [("storage".to_string(), Quantity(s.to_string()))].into()
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pvc_roundtrip_request() {
        let pvc = make_pvc(
            "disk-123",
            "1048576",
            None,
            Some("Pending"),
            "alice",
            "acme",
            "web",
            Some("db"),
            None,
        );
        let disk = pvc_to_disk(&pvc).unwrap();
        assert_eq!(disk.id, "disk-123");
        assert_eq!(disk.storage_requested, 1048576);
        assert_eq!(disk.owner, "alice");
        assert_eq!(disk.org_name, "acme");
        assert_eq!(disk.project_name, "web");
        assert_eq!(disk.name.as_deref(), Some("db"));
        assert_eq!(disk.status, DiskStatus::Pending);
    }

    #[test]
    fn phase_maps_to_status() {
        let bound = make_pvc(
            "d", "1024", Some("2048"), Some("Bound"), "a", "acme", "web", None, None,
        );
        assert_eq!(pvc_to_disk(&bound).unwrap().status, DiskStatus::Ready);

        let lost = make_pvc(
            "d", "1024", None, Some("Lost"), "a", "acme", "web", None, None,
        );
        assert_eq!(pvc_to_disk(&lost).unwrap().status, DiskStatus::Broken);
    }

    #[test]
    fn storage_real_preferred_over_requested() {
        let pvc = make_pvc(
            "d", "1024", Some("2048"), Some("Bound"), "a", "acme", "web", None, None,
        );
        let disk = pvc_to_disk(&pvc).unwrap();
        assert_eq!(disk.storage_real, Some(2048));
    }

    #[test]
    fn vcluster_alias_wins_as_id() {
        let mut pvc = make_pvc(
            "host-mangled-xyz",
            "1024",
            None,
            Some("Pending"),
            "a",
            "acme",
            "web",
            None,
            None,
        );
        pvc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                labels::VCLUSTER_OBJECT_NAME_ANNOTATION.to_string(),
                "disk-abc".to_string(),
            );
        let disk = pvc_to_disk(&pvc).unwrap();
        assert_eq!(disk.id, "disk-abc");
    }

    #[test]
    fn missing_org_falls_back_to_no_org_sentinel() {
        let mut pvc = make_pvc(
            "d", "1024", None, Some("Pending"), "a", "acme", "web", None, None,
        );
        if let Some(labels) = pvc.metadata.labels.as_mut() {
            labels.remove(labels::ORG.legacy);
            labels.remove(labels::ORG.current);
        }
        assert_eq!(pvc_to_disk(&pvc).unwrap().org_name, "no-org");
    }

    #[test]
    fn disk_name_validation() {
        assert!(validate_disk_name("db").is_err()); // too short
        assert!(validate_disk_name("a".repeat(41).as_str()).is_err()); // too long
        assert!(validate_disk_name("Db").is_err()); // uppercase
        assert!(validate_disk_name("db1").is_ok());
        assert!(validate_disk_name("my-db-1").is_ok());
        assert!(validate_disk_name("1db").is_err()); // must start with letter
    }

    #[test]
    fn timestamp_roundtrip() {
        let now = Utc::now();
        let dumped = dump_timestamp(now);
        let loaded = load_timestamp(&dumped).unwrap();
        assert!((loaded.timestamp_millis() - now.timestamp_millis()).abs() < 2);
    }
}
