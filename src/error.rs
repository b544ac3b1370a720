//! Typed domain errors (§7). The gateway and disk service return
//! `Result<T, DiskError>`; binaries wrap these in `anyhow::Context` at the
//! call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("disk name {0:?} already used in this project")]
    DiskNameUsed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("disk is already in use: {0}")]
    DiskAlreadyInUse(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("storage quota exceeded for project: requested {requested}, available {available}")]
    QuotaExceeded { requested: i64, available: i64 },

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("fatal misconfiguration: {0}")]
    Fatal(String),
}

impl DiskError {
    /// Maps a Kubernetes API `Status` response's `code` into a `DiskError`,
    /// per `original_source/platform_disk_api/kube_client.py`'s
    /// `_raise_for_status`.
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => DiskError::Validation(message),
            404 => DiskError::NotFound(message),
            409 => DiskError::Conflict(message),
            422 => DiskError::Validation(message),
            401 | 403 => DiskError::Permission(message),
            410 | 408 | 429 | 500..=599 => DiskError::Transient(message),
            _ => DiskError::Transient(message),
        }
    }

    /// The fixed admission-controller error-code mapping (§4.D "Error
    /// surface").
    pub fn admission_code(&self) -> u16 {
        match self {
            DiskError::NotFound(_) => 404,
            DiskError::Conflict(_) | DiskError::DiskNameUsed(_) | DiskError::DiskAlreadyInUse(_) => 409,
            DiskError::Validation(_) => 422,
            DiskError::Permission(_) => 403,
            _ => 400,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiskError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_code_mapping() {
        assert_eq!(DiskError::NotFound("x".into()).admission_code(), 404);
        assert_eq!(DiskError::Conflict("x".into()).admission_code(), 409);
        assert_eq!(DiskError::DiskNameUsed("x".into()).admission_code(), 409);
        assert_eq!(DiskError::DiskAlreadyInUse("x".into()).admission_code(), 409);
        assert_eq!(DiskError::Validation("x".into()).admission_code(), 422);
        assert_eq!(DiskError::Permission("x".into()).admission_code(), 403);
        assert_eq!(
            DiskError::Transient("x".into()).admission_code(),
            400
        );
    }

    #[test]
    fn status_code_mapping() {
        assert!(matches!(
            DiskError::from_status_code(404, "x"),
            DiskError::NotFound(_)
        ));
        assert!(matches!(
            DiskError::from_status_code(409, "x"),
            DiskError::Conflict(_)
        ));
        assert!(matches!(
            DiskError::from_status_code(410, "x"),
            DiskError::Transient(_)
        ));
    }
}
