//! Engine error taxonomy.
//!
//! Every failure surfaced by the backup and restore managers is an
//! [`EngineError`]. Its [`ErrorKind`] is what gets persisted on a failed
//! Backup Record and what RPC clients receive in `error.data.kind`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::runtime::RuntimeError;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NameConflict,
    ImageNotFound,
    Corrupt,
    StorageUnavailable,
    StoragePermissionDenied,
    BackupInProgress,
    Cancelled,
    InjectionFailed,
    /// Runtime adapter call failed or timed out.
    RuntimeFailure,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NameConflict => "name_conflict",
            ErrorKind::ImageNotFound => "image_not_found",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::StoragePermissionDenied => "storage_permission_denied",
            ErrorKind::BackupInProgress => "backup_in_progress",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InjectionFailed => "injection_failed",
            ErrorKind::RuntimeFailure => "runtime_failure",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("image not found locally: {0}")]
    ImageNotFound(String),

    #[error("archive corrupt: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage permission denied: {0}")]
    StoragePermissionDenied(String),

    #[error("backup already in progress for {0}")]
    BackupInProgress(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("archive injection into {0} did not complete")]
    InjectionFailed(String),

    #[error("container runtime: {0}")]
    Runtime(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("catalog: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::NameConflict(_) => ErrorKind::NameConflict,
            EngineError::ImageNotFound(_) => ErrorKind::ImageNotFound,
            EngineError::Corrupt(_) => ErrorKind::Corrupt,
            EngineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            EngineError::StoragePermissionDenied(_) => ErrorKind::StoragePermissionDenied,
            EngineError::BackupInProgress(_) => ErrorKind::BackupInProgress,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::InjectionFailed(_) => ErrorKind::InjectionFailed,
            EngineError::Runtime(_) => ErrorKind::RuntimeFailure,
            EngineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            EngineError::Catalog(_) | EngineError::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => EngineError::StorageUnavailable(msg),
            StorageError::PermissionDenied(msg) => EngineError::StoragePermissionDenied(msg),
            StorageError::NotFound(key) => EngineError::not_found("archive", key),
            StorageError::Corrupt(msg) => EngineError::Corrupt(msg),
            StorageError::Io(e) => EngineError::Io(e),
        }
    }
}

impl From<RuntimeError> for EngineError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(name) => EngineError::not_found("container", name),
            other => EngineError::Runtime(other.to_string()),
        }
    }
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => EngineError::Io(e),
            other => EngineError::Corrupt(other.to_string()),
        }
    }
}

/// Failure reason persisted on a Failed Backup Record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for FailureReason {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_keep_their_kind() {
        let err: EngineError = StorageError::Unavailable("nas01 unreachable".into()).into();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

        let err: EngineError = StorageError::PermissionDenied("bucket".into()).into();
        assert_eq!(err.kind(), ErrorKind::StoragePermissionDenied);

        let err: EngineError = StorageError::NotFound("web1/abc/archive.cbk.gz".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn runtime_not_found_becomes_container_not_found() {
        let err: EngineError = RuntimeError::NotFound("web1".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "container not found: web1");

        let err: EngineError = RuntimeError::Timeout("export_filesystem".into()).into();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    }

    #[test]
    fn failure_reason_serializes_kind_in_snake_case() {
        let reason = FailureReason::from(&EngineError::Cancelled);
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains(r#""kind":"cancelled""#));
        assert!(json.contains("operation cancelled"));
    }
}
