//! The mutating admission webhook (§4.D): PVC metadata/storage-class
//! mutation, Pod disk-volume injection, and the HTTPS wire handling that
//! ties both to a Kubernetes `AdmissionReview`.

pub mod patch;
pub mod pod_injection;
pub mod pvc_mutation;
pub mod server;

pub use server::{serve, AdmissionState};
