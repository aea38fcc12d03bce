//! Pluggable archive storage.
//!
//! Every backend implements the same five-operation contract over opaque
//! keys. Backends know nothing about Backup Records; the catalog owns those.
//! Network variants are wrapped in [`RetryingBackend`] so that transient
//! `Unavailable` failures are retried with backoff before surfacing.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{RetryConfig, StorageConfig};
use crate::core::codec::ARCHIVE_EXTENSION;

pub mod local;
pub mod nfs;
pub mod retry;
pub mod s3;
pub mod spool;
pub mod ssh;

pub use local::LocalBackend;
pub use nfs::NfsBackend;
pub use retry::{RetryPolicy, RetryingBackend};
pub use s3::S3Backend;
pub use ssh::SshBackend;

/// Owned byte stream passed in and out of backends.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Only from `get` on an absent key.
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("backend reported corruption: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Classify a filesystem error. `network` enables the errnos that mean
    /// the remote end went away (stale handle, timeouts, host down).
    pub fn from_io(err: io::Error, key: &str, network: bool) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => return StorageError::NotFound(key.to_string()),
            io::ErrorKind::PermissionDenied => {
                return StorageError::PermissionDenied(format!("{}: {}", key, err));
            }
            _ => {}
        }

        if network {
            if let Some(code) = err.raw_os_error() {
                if matches!(
                    code,
                    libc::ESTALE
                        | libc::EIO
                        | libc::ETIMEDOUT
                        | libc::ENOTCONN
                        | libc::EHOSTDOWN
                        | libc::EHOSTUNREACH
                        | libc::ECONNREFUSED
                        | libc::ECONNRESET
                ) {
                    return StorageError::Unavailable(format!("{}: {}", key, err));
                }
            }
        }

        StorageError::Io(err)
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short variant name for logs and status output.
    fn kind(&self) -> &'static str;

    /// Store `data` under `key`, overwriting any previous object.
    async fn put(&self, key: &str, data: ByteStream) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove `key`. Succeeds when the key is already absent.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Cheap reachability probe.
    async fn test_connection(&self) -> Result<(), StorageError> {
        self.list("").await.map(|_| ())
    }

    /// Free bytes at the destination, when the backend can tell.
    async fn available_space(&self) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }
}

/// `{container_ref}/{backup_id}/archive.cbk.gz`
pub fn archive_key(container_ref: &str, backup_id: &Uuid) -> String {
    format!("{}/{}/archive.{}", container_ref, backup_id, ARCHIVE_EXTENSION)
}

/// Reject keys that could escape a backend's root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid storage key: {:?}", key),
        )));
    }
    Ok(())
}

/// Backends by `storage_backend_id`.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(id.into(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn StorageBackend>)> {
        self.backends.iter()
    }

    /// Build every configured backend. Network variants get the retry wrapper.
    /// An NFS share that cannot be attached yet is still registered; its
    /// operations report `Unavailable` until the mount appears.
    pub async fn from_config(
        configs: &[StorageConfig],
        retry: &RetryConfig,
        staging_dir: PathBuf,
    ) -> Result<Self> {
        let policy = RetryPolicy::from(retry);
        let mut registry = Self::new();

        for config in configs {
            let backend: Arc<dyn StorageBackend> = match config {
                StorageConfig::Local { path, .. } => Arc::new(LocalBackend::new(path.clone())),
                StorageConfig::Nfs(nfs) => {
                    let backend = NfsBackend::new(nfs.clone());
                    if let Err(e) = backend.attach().await {
                        warn!(storage = %nfs.id, error = %e, "NFS storage not attached yet");
                    }
                    Arc::new(RetryingBackend::new(
                        Arc::new(backend),
                        policy.clone(),
                        staging_dir.clone(),
                    ))
                }
                StorageConfig::Ssh(ssh) => Arc::new(RetryingBackend::new(
                    Arc::new(SshBackend::new(ssh.clone(), staging_dir.clone())),
                    policy.clone(),
                    staging_dir.clone(),
                )),
                StorageConfig::S3(s3) => {
                    let backend = S3Backend::new(s3.clone(), staging_dir.clone())
                        .with_context(|| format!("Failed to configure S3 storage '{}'", s3.id))?;
                    Arc::new(RetryingBackend::new(
                        Arc::new(backend),
                        policy.clone(),
                        staging_dir.clone(),
                    ))
                }
            };

            info!(storage = %config.id(), kind = backend.kind(), "Storage backend registered");
            registry.insert(config.id(), backend);
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_key_layout() {
        let id = Uuid::now_v7();
        let key = archive_key("web1", &id);
        assert_eq!(key, format!("web1/{}/archive.cbk.gz", id));
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn keys_cannot_escape_root() {
        for key in ["", "/etc/passwd", "../x", "a/../../b", "a//b", "a/./b", "a\\b"] {
            assert!(validate_key(key).is_err(), "accepted {:?}", key);
        }
    }

    #[tokio::test]
    async fn unmounted_nfs_is_registered_but_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![
            StorageConfig::Local {
                id: "disk".into(),
                path: dir.path().join("archives"),
            },
            StorageConfig::Nfs(crate::config::NfsConfig {
                id: "nas".into(),
                server: "nas01".into(),
                export: "/export/backups".into(),
                mount_point: dir.path().join("nas"),
                options: "vers=4,rw".into(),
                auto_mount: false,
            }),
        ];
        let retry = RetryConfig {
            max_attempts: 1,
            ..Default::default()
        };

        let registry = StorageRegistry::from_config(&configs, &retry, dir.path().join("staging"))
            .await
            .unwrap();
        assert!(registry.contains("disk"));
        let nas = registry.get("nas").unwrap();
        assert_eq!(nas.kind(), "nfs");
        assert!(matches!(
            nas.test_connection().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[test]
    fn io_classification_respects_transport() {
        let stale = || io::Error::from_raw_os_error(libc::ESTALE);

        assert!(StorageError::from_io(stale(), "k", true).is_retryable());
        assert!(!StorageError::from_io(stale(), "k", false).is_retryable());

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            StorageError::from_io(missing, "k", true),
            StorageError::NotFound(_)
        ));
    }
}
