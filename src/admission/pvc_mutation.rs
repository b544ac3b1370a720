//! PVC admission mutation logic (§4.D "PVC mutation"). Pure: produces a
//! JSON Patch from a PVC object and its resolved org/project; DiskNaming
//! creation (which needs the gateway) happens in `server.rs` using the
//! `requested_disk_name` this returns.

use crate::admission::patch::{self, add};
use crate::disk;
use crate::error::DiskError;
use crate::labels::{self, KeyPair};
use chrono::Utc;
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Extracts `(org, project)` from a namespace's labels, per the dual
/// label vocabulary. Declines with `Validation` if either is missing.
pub fn resolve_org_project(
    namespace_labels: Option<&BTreeMap<String, String>>,
) -> Result<(String, String), DiskError> {
    let empty = BTreeMap::new();
    let labels_map = namespace_labels.unwrap_or(&empty);
    let org = labels::ORG
        .read(labels_map)
        .ok_or_else(|| DiskError::Validation("Namespace lacks required org/project labels".to_string()))?;
    let project = labels::PROJECT
        .read(labels_map)
        .ok_or_else(|| DiskError::Validation("Namespace lacks required org/project labels".to_string()))?;
    Ok((org.to_string(), project.to_string()))
}

/// Builds the PVC admission patch and returns the disk name that should be
/// used to create (or re-verify) a `DiskNaming`, if the PVC requested one.
/// The returned name already has the StatefulSet `-N` suffix applied.
pub fn build_patch(
    pvc: &PersistentVolumeClaim,
    owner: &str,
    org: &str,
    project: &str,
    storage_class_name: &str,
) -> (Vec<PatchOperation>, Option<String>) {
    let mut ops = Vec::new();

    if pvc.metadata.labels.is_none() {
        ops.push(add(patch::pointer(&["metadata", "labels"]), json!({})));
    }
    if pvc.metadata.annotations.is_none() {
        ops.push(add(patch::pointer(&["metadata", "annotations"]), json!({})));
    }

    let empty = BTreeMap::new();
    let existing_labels = pvc.metadata.labels.as_ref().unwrap_or(&empty);
    let existing_annotations = pvc.metadata.annotations.as_ref().unwrap_or(&empty);

    add_pair_if_absent(&mut ops, "labels", existing_labels, labels::MARK, "true");
    add_pair_if_absent(&mut ops, "labels", existing_labels, labels::ORG, org);
    add_pair_if_absent(&mut ops, "labels", existing_labels, labels::PROJECT, project);
    let owner_value = labels::owner_to_label_value(owner);
    add_pair_if_absent(&mut ops, "labels", existing_labels, labels::USER, &owner_value);

    let now = disk::dump_timestamp(Utc::now());
    add_pair_if_absent(&mut ops, "annotations", existing_annotations, labels::CREATED_AT, &now);

    let requested_name = resolve_requested_name(&mut ops, pvc, existing_annotations);

    let current_storage_class = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref());
    if current_storage_class != Some(storage_class_name) {
        ops.push(add(
            patch::pointer(&["spec", "storageClassName"]),
            json!(storage_class_name),
        ));
    }

    (ops, requested_name)
}

/// If the PVC requested a disk name and the PVC name carries a StatefulSet
/// ordinal suffix (`-\d+$`), appends it to the requested name and patches
/// the annotation in place (§4.D step 4, StatefulSet exception).
fn resolve_requested_name(
    ops: &mut Vec<PatchOperation>,
    pvc: &PersistentVolumeClaim,
    existing_annotations: &BTreeMap<String, String>,
) -> Option<String> {
    let name = labels::NAME.read(existing_annotations)?.to_string();
    let pvc_name = pvc.metadata.name.as_deref().unwrap_or_default();
    let Some(suffix) = statefulset_suffix(pvc_name) else {
        return Some(name);
    };
    if name.ends_with(&suffix) {
        // Already carries its ordinal (re-invocation): nothing to patch.
        return Some(name);
    }
    let suffixed = format!("{name}{suffix}");
    if suffixed != name {
        ops.push(add(
            patch::pointer(&["metadata", "annotations", labels::NAME.legacy]),
            json!(suffixed),
        ));
        ops.push(add(
            patch::pointer(&["metadata", "annotations", labels::NAME.current]),
            json!(suffixed),
        ));
    }
    Some(suffixed)
}

fn statefulset_suffix(pvc_name: &str) -> Option<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"-(\d+)$").unwrap());
    re.find(pvc_name).map(|m| m.as_str().to_string())
}

fn add_pair_if_absent(
    ops: &mut Vec<PatchOperation>,
    field: &str,
    existing: &BTreeMap<String, String>,
    pair: KeyPair,
    value: &str,
) {
    if !existing.contains_key(pair.legacy) {
        ops.push(add(
            patch::pointer(&["metadata", field, pair.legacy]),
            json!(value),
        ));
    }
    if !existing.contains_key(pair.current) {
        ops.push(add(
            patch::pointer(&["metadata", field, pair.current]),
            json!(value),
        ));
    }
}
