//! The K8s gateway (§4.A): a thin, typed façade over PVC/Pod/Namespace/
//! StorageClass/DiskNaming/PersistentVolume CRUD, pod watches, and node
//! stats-summary scraping. Everything above this layer talks `DiskError`,
//! never raw `kube::Error`.

use crate::config::{KubeAuthType, KubeConfig};
use crate::disk_naming::DiskNaming;
use crate::error::DiskError;
use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::config::AuthInfo;
use kube::{Client, Config, ResourceExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Per-pod-per-volume usage sample from a node's kubelet stats-summary.
#[derive(Debug, Clone)]
pub struct VolumeUsageSample {
    pub pvc_namespace: String,
    pub pvc_name: String,
    pub used_bytes: i64,
}

pub struct KubeGateway {
    client: RwLock<Client>,
    config: KubeConfig,
    last_token_reload: Mutex<Instant>,
}

impl KubeGateway {
    pub async fn new(config: KubeConfig) -> Result<Self, DiskError> {
        let client = Self::build_client(&config).await?;
        Ok(Self {
            client: RwLock::new(client),
            config,
            last_token_reload: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        })
    }

    /// Builds a gateway around an already-constructed client, bypassing
    /// `KubeConfig`-driven client construction entirely. Used by integration
    /// tests that obtain their `Client` from a test cluster's kubeconfig.
    pub fn from_client(client: Client, config: KubeConfig) -> Self {
        Self {
            client: RwLock::new(client),
            config,
            last_token_reload: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        }
    }

    async fn build_client(config: &KubeConfig) -> Result<Client, DiskError> {
        match config.endpoint_url.as_deref() {
            None => Client::try_default()
                .await
                .map_err(|e| DiskError::Fatal(format!("failed to create in-cluster client: {e}"))),
            Some(endpoint) => {
                let kube_config = Self::build_kube_config(config, endpoint)?;
                Client::try_from(kube_config)
                    .map_err(|e| DiskError::Fatal(format!("failed to build kube client: {e}")))
            }
        }
    }

    /// Builds a `kube::Config` directly from our flat `KubeConfig` fields so
    /// we can reuse `kube::Client`'s TLS/auth plumbing instead of
    /// reimplementing it.
    fn build_kube_config(config: &KubeConfig, endpoint: &str) -> Result<Config, DiskError> {
        let uri: http::Uri = endpoint
            .parse()
            .map_err(|e| DiskError::Fatal(format!("invalid kube endpoint url {endpoint:?}: {e}")))?;
        let mut kube_config = Config::new(uri);
        kube_config.default_namespace = config.namespace.clone();
        kube_config.connect_timeout = Some(Duration::from_secs(config.conn_timeout_secs));
        kube_config.read_timeout = Some(Duration::from_secs(config.read_timeout_secs));

        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| DiskError::Fatal(format!("failed to read CA file: {e}")))?;
            kube_config.root_cert = Some(vec![pem]);
        } else if let Some(ca_data) = &config.ca_data_pem {
            kube_config.root_cert = Some(vec![ca_data.clone().into_bytes()]);
        }

        let mut auth_info = AuthInfo::default();
        match config.auth_type {
            KubeAuthType::None => {}
            KubeAuthType::Token => {
                let token = Self::read_token(config)?;
                auth_info.token = Some(token.into());
            }
            KubeAuthType::Certificate => {
                auth_info.client_certificate = config
                    .client_cert_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string());
                auth_info.client_key = config
                    .client_key_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string());
            }
        }
        kube_config.auth_info = auth_info;

        Ok(kube_config)
    }

    fn read_token(config: &KubeConfig) -> Result<String, DiskError> {
        if let Some(path) = &config.token_path {
            std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| DiskError::Fatal(format!("failed to read token file: {e}")))
        } else {
            Err(DiskError::Fatal(
                "auth_type=token requires token_path".to_string(),
            ))
        }
    }

    /// Debounced token hot-reload (§9): re-reads the token file and rebuilds
    /// the client, but only if the last reload was more than
    /// `token_reload_interval_secs` ago, so concurrent 401s don't cause an
    /// I/O storm.
    async fn reload_token(&self) -> Result<(), DiskError> {
        if self.config.auth_type != KubeAuthType::Token {
            return Ok(());
        }
        let mut last = self.last_token_reload.lock().await;
        if last.elapsed() < Duration::from_secs(self.config.token_reload_interval_secs) {
            return Ok(());
        }
        *last = Instant::now();
        drop(last);

        info!("reloading kube bearer token from disk");
        let fresh = Self::build_client(&self.config).await?;
        *self.client.write().await = fresh;
        Ok(())
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    /// Runs `op` once; on an HTTP 401 reloads the token and retries exactly
    /// once (§4.A "On 401 ... reloads the token and retries the request
    /// exactly once").
    async fn with_unauthorized_retry<T, F, Fut>(&self, op: F) -> Result<T, DiskError>
    where
        F: Fn(Client) -> Fut,
        Fut: std::future::Future<Output = kube::Result<T>>,
    {
        let client = self.client().await;
        match op(client).await {
            Ok(v) => Ok(v),
            Err(e) if is_unauthorized(&e) => {
                warn!("kube request unauthorized, reloading token and retrying once");
                self.reload_token().await?;
                let client = self.client().await;
                op(client).await.map_err(map_kube_error)
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }

    // ---------------------------------------------------------------- PVC

    pub async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, DiskError> {
        let namespace = namespace.to_string();
        let pvc = pvc.clone();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client, &namespace);
            let pvc = pvc.clone();
            async move { api.create(&PostParams::default(), &pvc).await }
        })
        .await
    }

    pub async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client, &namespace);
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await
    }

    pub async fn list_pvcs(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<PersistentVolumeClaim>, DiskError> {
        let namespace = namespace.map(str::to_string);
        let label_selector = label_selector.map(str::to_string);
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolumeClaim> = match &namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            };
            let mut lp = ListParams::default();
            if let Some(sel) = &label_selector {
                lp = lp.labels(sel);
            }
            async move { api.list(&lp).await.map(|l| l.items) }
        })
        .await
    }

    pub async fn patch_pvc_merge(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<PersistentVolumeClaim, DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client, &namespace);
            let name = name.clone();
            let patch = patch.clone();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
            }
        })
        .await
    }

    pub async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client, &namespace);
            let name = name.clone();
            async move { api.delete(&name, &DeleteParams::default()).await.map(|_| ()) }
        })
        .await
    }

    // ---------------------------------------------------------------- Pod

    /// Lists all pods cluster-wide, returning the list's `resourceVersion`
    /// alongside the items so a watch can resume from it.
    pub async fn list_all_pods(&self) -> Result<(Vec<Pod>, String), DiskError> {
        self.with_unauthorized_retry(move |client| {
            let api: Api<Pod> = Api::all(client);
            async move {
                let list = api.list(&ListParams::default()).await?;
                let rv = list.metadata.resource_version.clone().unwrap_or_default();
                Ok((list.items, rv))
            }
        })
        .await
    }

    /// Opens a cluster-wide pod watch from `resource_version`, with
    /// bookmarks enabled. Returned stream yields raw `WatchEvent`s; callers
    /// are responsible for restart-on-410 and logging (§4.E).
    pub async fn watch_all_pods(
        &self,
        resource_version: &str,
    ) -> Result<impl futures::Stream<Item = kube::Result<WatchEvent<Pod>>>, DiskError> {
        let client = self.client().await;
        let api: Api<Pod> = Api::all(client);
        let wp = WatchParams::default().bookmarks(true);
        api.watch(&wp, resource_version)
            .await
            .map_err(map_kube_error)
    }

    // ---------------------------------------------------------- Namespace

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, DiskError> {
        let name = name.to_string();
        let result = self
            .with_unauthorized_retry(move |client| {
                let api: Api<Namespace> = Api::all(client);
                let name = name.clone();
                async move { api.get_opt(&name).await }
            })
            .await?;
        Ok(result)
    }

    pub async fn create_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Namespace, DiskError> {
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<Namespace> = Api::all(client);
            let ns = Namespace {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            async move { api.create(&PostParams::default(), &ns).await }
        })
        .await
    }

    /// Idempotent: creates the namespace for (org, project) if it doesn't
    /// exist yet.
    pub async fn ensure_project_namespace(
        &self,
        namespace_name: &str,
        org: &str,
        project: &str,
    ) -> Result<(), DiskError> {
        if self.get_namespace(namespace_name).await?.is_some() {
            return Ok(());
        }
        let mut labels = BTreeMap::new();
        crate::labels::ORG.write(&mut labels, org);
        crate::labels::PROJECT.write(&mut labels, project);
        match self.create_namespace(namespace_name, labels).await {
            Ok(_) => Ok(()),
            Err(DiskError::Conflict(_)) => Ok(()), // raced with another creator
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------ StorageClass

    pub async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, DiskError> {
        self.with_unauthorized_retry(move |client| {
            let api: Api<StorageClass> = Api::all(client);
            async move { api.list(&ListParams::default()).await.map(|l| l.items) }
        })
        .await
    }

    pub async fn default_storage_class(&self) -> Result<Option<StorageClass>, DiskError> {
        let classes = self.list_storage_classes().await?;
        Ok(classes.into_iter().find(|sc| {
            sc.annotations()
                .get(DEFAULT_STORAGE_CLASS_ANNOTATION)
                .map(String::as_str)
                == Some("true")
        }))
    }

    // -------------------------------------------------------- Node stats

    pub async fn list_nodes(&self) -> Result<Vec<Node>, DiskError> {
        self.with_unauthorized_retry(move |client| {
            let api: Api<Node> = Api::all(client);
            async move { api.list(&ListParams::default()).await.map(|l| l.items) }
        })
        .await
    }

    pub async fn get_stats_summary(
        &self,
        node_name: &str,
    ) -> Result<Vec<VolumeUsageSample>, DiskError> {
        let node_name = node_name.to_string();
        let summary: StatsSummary = self
            .with_unauthorized_retry(move |client| {
                let node_name = node_name.clone();
                async move {
                    let path = format!("/api/v1/nodes/{node_name}/proxy/stats/summary");
                    let request = http::Request::get(path).body(Vec::new()).unwrap();
                    client.request(request).await
                }
            })
            .await?;

        let mut out = Vec::new();
        for pod in summary.pods {
            for vol in pod.volume.unwrap_or_default() {
                if let (Some(pvc_ref), Some(used_bytes)) = (vol.pvc_ref, vol.used_bytes) {
                    out.push(VolumeUsageSample {
                        pvc_namespace: pvc_ref.namespace,
                        pvc_name: pvc_ref.name,
                        used_bytes,
                    });
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------- DiskNaming

    pub async fn create_disk_naming(
        &self,
        namespace: &str,
        name: &str,
        disk_id: &str,
    ) -> Result<DiskNaming, DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        let disk_id = disk_id.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<DiskNaming> = Api::namespaced(client, &namespace);
            let naming = DiskNaming::new(
                &name,
                crate::disk_naming::DiskNamingSpec {
                    disk_id: disk_id.clone(),
                },
            );
            async move { api.create(&PostParams::default(), &naming).await }
        })
        .await
    }

    pub async fn get_disk_naming(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DiskNaming, DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<DiskNaming> = Api::namespaced(client, &namespace);
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await
    }

    pub async fn list_disk_namings(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DiskNaming>, DiskError> {
        let namespace = namespace.map(str::to_string);
        self.with_unauthorized_retry(move |client| {
            let api: Api<DiskNaming> = match &namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            };
            async move { api.list(&ListParams::default()).await.map(|l| l.items) }
        })
        .await
    }

    pub async fn delete_disk_naming(&self, namespace: &str, name: &str) -> Result<(), DiskError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<DiskNaming> = Api::namespaced(client, &namespace);
            let name = name.clone();
            async move { api.delete(&name, &DeleteParams::default()).await.map(|_| ()) }
        })
        .await
    }

    // ------------------------------------------------- PersistentVolume

    pub async fn get_pv(&self, name: &str) -> Result<PersistentVolume, DiskError> {
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolume> = Api::all(client);
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await
    }

    pub async fn patch_pv_merge(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<PersistentVolume, DiskError> {
        let name = name.to_string();
        self.with_unauthorized_retry(move |client| {
            let api: Api<PersistentVolume> = Api::all(client);
            let name = name.clone();
            let patch = patch.clone();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
            }
        })
        .await
    }
}

fn is_unauthorized(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 401)
}

pub fn map_kube_error(e: kube::Error) -> DiskError {
    match e {
        kube::Error::Api(resp) => DiskError::from_status_code(resp.code, resp.message),
        other => DiskError::Transient(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StatsSummary {
    pods: Vec<PodStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStats {
    #[serde(default)]
    volume: Option<Vec<VolumeStats>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeStats {
    #[serde(default)]
    pvc_ref: Option<PvcRef>,
    #[serde(default)]
    used_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PvcRef {
    name: String,
    namespace: String,
}

