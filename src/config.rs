//! Environment/CLI configuration via `clap::Parser` with `env` fallbacks.
//! Each binary has its own top-level config struct; all of them embed
//! [`KubeConfig`] and [`DiskConfig`].

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KubeAuthType {
    None,
    Token,
    Certificate,
}

#[derive(Parser, Debug, Clone)]
pub struct KubeConfig {
    /// Kubernetes API server URL. Defaults to in-cluster discovery when unset.
    #[arg(long, env = "KUBE_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    #[arg(long, env = "KUBE_AUTH_TYPE", value_enum, default_value_t = KubeAuthType::None)]
    pub auth_type: KubeAuthType,

    #[arg(long, env = "KUBE_CA_PATH")]
    pub ca_path: Option<PathBuf>,

    #[arg(long, env = "KUBE_CA_DATA")]
    pub ca_data_pem: Option<String>,

    /// Bearer token file, hot-reloaded on 401 and on `token_reload_interval_secs`.
    #[arg(long, env = "KUBE_TOKEN_PATH")]
    pub token_path: Option<PathBuf>,

    #[arg(long, env = "KUBE_CLIENT_CERT_PATH")]
    pub client_cert_path: Option<PathBuf>,

    #[arg(long, env = "KUBE_CLIENT_KEY_PATH")]
    pub client_key_path: Option<PathBuf>,

    #[arg(long, env = "KUBE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    #[arg(long, env = "KUBE_CONN_TIMEOUT_SECS", default_value_t = 30)]
    pub conn_timeout_secs: u64,

    #[arg(long, env = "KUBE_READ_TIMEOUT_SECS", default_value_t = 100)]
    pub read_timeout_secs: u64,

    #[arg(long, env = "KUBE_WATCH_TIMEOUT_SECS", default_value_t = 1800)]
    pub watch_timeout_secs: u64,

    #[arg(long, env = "KUBE_CONN_POOL_SIZE", default_value_t = 100)]
    pub pool_size: usize,

    #[arg(long, env = "KUBE_TOKEN_RELOAD_INTERVAL_SECS", default_value_t = 300)]
    pub token_reload_interval_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct DiskConfig {
    /// Storage class to force on every managed PVC. Empty means: discover
    /// the cluster's default `StorageClass` at startup.
    #[arg(long, env = "STORAGE_CLASS_NAME", default_value = "")]
    pub storage_class_name: String,

    #[arg(long, env = "STORAGE_LIMIT_PER_PROJECT", default_value_t = 1024 * 1024 * 1024 * 1024)]
    pub storage_limit_per_project: i64,

    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 8443)]
    pub port: u16,

    #[arg(long, env = "SERVER_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "SERVER_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct EventsConfig {
    /// Event-bus consumer is disabled entirely when unset.
    #[arg(long, env = "EVENTS_URL")]
    pub url: Option<String>,

    #[arg(long, env = "EVENTS_TOKEN")]
    pub token: Option<String>,

    #[arg(long, env = "EVENTS_CONSUMER_NAME", default_value = "platform-disk-api")]
    pub name: String,
}

#[derive(Parser, Debug, Clone)]
pub struct CorsConfig {
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
}

/// Admission-controller webhook binary configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct AdmissionConfig {
    #[command(flatten)]
    pub server: ServerConfig,
    #[command(flatten)]
    pub kube: KubeConfig,
    #[command(flatten)]
    pub disk: DiskConfig,

    /// Gate the Pod-mutation path behind configuration: some source
    /// variants treat it as a no-op (§9 Open Questions).
    #[arg(long, env = "ADMISSION_ENABLE_POD_INJECTION", default_value_t = true)]
    pub enable_pod_injection: bool,
}

/// Usage-watcher binary configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct UsageWatcherConfig {
    #[command(flatten)]
    pub kube: KubeConfig,
    #[command(flatten)]
    pub disk: DiskConfig,

    #[arg(long, env = "USED_BYTES_INTERVAL_SECS", default_value_t = 60)]
    pub used_bytes_interval_secs: u64,

    #[arg(long, env = "LIFESPAN_SWEEP_INTERVAL_SECS", default_value_t = 600)]
    pub lifespan_sweep_interval_secs: u64,
}

/// Project-event consumer binary configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct ProjectEventsConfig {
    #[command(flatten)]
    pub kube: KubeConfig,
    #[command(flatten)]
    pub disk: DiskConfig,
    #[command(flatten)]
    pub events: EventsConfig,
}

/// Namespace-migration batch job configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct MigrationConfig {
    #[command(flatten)]
    pub kube: KubeConfig,
    #[command(flatten)]
    pub disk: DiskConfig,

    /// Legacy namespace to migrate PVCs out of.
    #[arg(long, env = "MIGRATION_LEGACY_NAMESPACE")]
    pub legacy_namespace: String,

    #[arg(long, env = "MIGRATION_PVC_DELETE_TIMEOUT_SECS", default_value_t = 60)]
    pub pvc_delete_timeout_secs: u64,
}
