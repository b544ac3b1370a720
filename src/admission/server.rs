//! HTTPS wire handling for the admission webhook: `POST /mutate` and
//! `GET /ping` (§6 "Admission webhook wire").

use crate::admission::{pod_injection, pvc_mutation};
use crate::config::ServerConfig;
use crate::disk::Disk;
use crate::error::DiskError;
use crate::gateway::KubeGateway;
use crate::service::DiskService;
use crate::{labels, naming};
use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct AdmissionState {
    pub gateway: Arc<KubeGateway>,
    pub service: Arc<DiskService>,
    pub enable_pod_injection: bool,
}

pub async fn serve(config: &ServerConfig, state: Arc<AdmissionState>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid server host/port")?;
    let cert_path = config.tls_cert_path.as_ref().context("tls_cert_path is required")?;
    let key_path = config.tls_key_path.as_ref().context("tls_key_path is required")?;
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .context("failed to load TLS cert/key")?;

    info!(%addr, "admission webhook listening");
    axum_server::bind_rustls(addr, tls_config)
        .serve(router(state).into_make_service())
        .await
        .context("admission server exited")
}

pub fn router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .route("/ping", get(ping))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> &'static str {
    "ok"
}

async fn mutate(
    State(state): State<Arc<AdmissionState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let Some(request) = review.request else {
        return Json(AdmissionResponse::invalid("admission review carries no request").into_review());
    };

    let response = match handle_request(&state, &request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "admission request declined");
            deny(&request, &e)
        }
    };
    Json(response.into_review())
}

async fn handle_request(
    state: &AdmissionState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, DiskError> {
    let base = AdmissionResponse::from(request);
    match request.kind.kind.as_str() {
        "PersistentVolumeClaim" => handle_pvc(state, request, base).await,
        "Pod" if state.enable_pod_injection => handle_pod(state, request, base).await,
        _ => Ok(base),
    }
}

fn deny(request: &AdmissionRequest<DynamicObject>, err: &DiskError) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request);
    response.allowed = false;
    response.result = Status {
        code: Some(err.admission_code() as i32),
        message: Some(err.to_string()),
        ..Default::default()
    };
    response
}

fn from_json_error(e: serde_json::Error) -> DiskError {
    DiskError::Validation(format!("malformed admission object: {e}"))
}

async fn handle_pvc(
    state: &AdmissionState,
    request: &AdmissionRequest<DynamicObject>,
    base: AdmissionResponse,
) -> Result<AdmissionResponse, DiskError> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| DiskError::Validation("admission request missing object".to_string()))?;
    let pvc: PersistentVolumeClaim =
        serde_json::from_value(serde_json::to_value(object).map_err(from_json_error)?).map_err(from_json_error)?;

    let namespace = request
        .namespace
        .clone()
        .ok_or_else(|| DiskError::Validation("admission request missing namespace".to_string()))?;
    let ns = state
        .gateway
        .get_namespace(&namespace)
        .await?
        .ok_or_else(|| DiskError::Validation(format!("namespace {namespace:?} not found")))?;
    let (org, project) = pvc_mutation::resolve_org_project(ns.metadata.labels.as_ref())?;

    let owner = request.user_info.username.clone().unwrap_or_default();
    let storage_class = state.service.resolve_storage_class().await?;

    let (ops, requested_name) = pvc_mutation::build_patch(&pvc, &owner, &org, &project, &storage_class);

    if let Some(name) = requested_name {
        let naming_name = naming::get_disk_naming_name(&name, &org, &project);
        let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
        match state.gateway.create_disk_naming(&namespace, &naming_name, &pvc_name).await {
            Ok(_) => {}
            Err(DiskError::Conflict(_)) => {
                // Admission re-invocation (e.g. StatefulSet replica reconcile):
                // treat a matching disk_id as success, per §4.D step 4.
                let existing = state.gateway.get_disk_naming(&namespace, &naming_name).await?;
                if existing.spec.disk_id != pvc_name {
                    return Err(DiskError::DiskNameUsed(name));
                }
            }
            Err(e) => return Err(e),
        }
    }

    base.with_patch(json_patch::Patch(ops))
        .map_err(|e| DiskError::Fatal(format!("failed to encode admission patch: {e}")))
}

async fn handle_pod(
    state: &AdmissionState,
    request: &AdmissionRequest<DynamicObject>,
    base: AdmissionResponse,
) -> Result<AdmissionResponse, DiskError> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| DiskError::Validation("admission request missing object".to_string()))?;
    let pod: Pod =
        serde_json::from_value(serde_json::to_value(object).map_err(from_json_error)?).map_err(from_json_error)?;

    let Some(raw) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::INJECT_DISK_ANNOTATION))
    else {
        return Ok(base);
    };

    // Pod must already carry org/project labels; otherwise allow unchanged
    // and wait for a re-invocation once another controller adds them.
    let Some(pod_labels) = pod.metadata.labels.as_ref() else {
        return Ok(base);
    };
    let Some(pod_org) = labels::ORG.read(pod_labels) else {
        return Ok(base);
    };
    let Some(pod_project) = labels::PROJECT.read(pod_labels) else {
        return Ok(base);
    };

    let entries = pod_injection::parse_injection_annotation(raw)?;
    for entry in &entries {
        pod_injection::validate_entry(entry)?;
    }

    let namespace = request
        .namespace
        .clone()
        .ok_or_else(|| DiskError::Validation("admission request missing namespace".to_string()))?;
    let ns = state
        .gateway
        .get_namespace(&namespace)
        .await?
        .ok_or_else(|| DiskError::Validation(format!("namespace {namespace:?} not found")))?;
    let (ns_org, ns_project) = pvc_mutation::resolve_org_project(ns.metadata.labels.as_ref())?;

    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        let uri = pod_injection::parse_disk_uri(&entry.disk_uri)?;
        pod_injection::check_org_project_consistency(
            &uri.org, &uri.project, &ns_org, &ns_project, pod_org, pod_project,
        )?;
        let disk = resolve_disk(state, &namespace, &ns_org, &ns_project, &uri.id_or_name).await?;
        resolved.push((entry, disk.id));
    }

    let ops = pod_injection::build_patch(&pod, &resolved);
    base.with_patch(json_patch::Patch(ops))
        .map_err(|e| DiskError::Fatal(format!("failed to encode admission patch: {e}")))
}

async fn resolve_disk(
    state: &AdmissionState,
    namespace: &str,
    org: &str,
    project: &str,
    id_or_name: &str,
) -> Result<Disk, DiskError> {
    match state.service.get_disk(namespace, id_or_name).await {
        Ok(disk) => Ok(disk),
        Err(e) if e.is_not_found() => {
            state.service.get_disk_by_name(namespace, org, project, id_or_name).await
        }
        Err(e) => Err(e),
    }
}
