//! Disk-management control plane for a multi-tenant Kubernetes compute
//! platform: a disk service, an admission webhook that injects disk
//! volumes into pods and PVC metadata, a usage watcher, a project-event
//! consumer, and a one-shot namespace-migration job.

pub mod admission;
pub mod config;
pub mod disk;
pub mod disk_naming;
pub mod error;
pub mod gateway;
pub mod labels;
pub mod migration;
pub mod naming;
pub mod project_events;
pub mod quantity;
pub mod service;
pub mod usage_watcher;

pub use error::DiskError;
