//! Backup orchestration.
//!
//! One `create_backup` call per container at a time. The archive is encoded
//! and uploaded in a single streaming pass, optionally re-read and
//! re-hashed, and only then is the record written to the catalog. Any
//! failure deletes the partial payload and catalogs a Failed record instead.
//! The image a Full backup commits lives only inside the archive: it is
//! removed from the runtime once the backup ends, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{ArchiveManifest, FORMAT_VERSION, encode_archive};
use super::locks::KeyedLocks;
use super::models::{BackupKind, BackupRecord, BackupStatus, is_valid_container_name};
use super::progress::{OperationHandle, OperationKind, OperationTracker};
use super::runtime::{ContainerRuntime, RuntimeError, timed};
use super::verifier::{VerifyResult, verify_archive};
use crate::db::records;
use crate::error::{EngineError, FailureReason};
use crate::storage::{ByteStream, StorageBackend, StorageRegistry, archive_key};

/// Repository Full backups are committed under.
pub const IMAGE_REPO_PREFIX: &str = "cbkd-backup";

const PIPE_CAPACITY: usize = 256 * 1024;

/// Lines of container log kept in an archive.
pub const LOG_TAIL_LINES: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    /// Pre-assigned so callers can cancel by id before the call returns.
    pub backup_id: Uuid,
    pub container_ref: String,
    pub kind: BackupKind,
    pub compression_level: u8,
    pub storage_backend_id: String,
    pub verify: bool,
    /// Archive the container's recent log output alongside its filesystem.
    pub include_logs: bool,
}

impl BackupRequest {
    pub fn new(container_ref: &str, kind: BackupKind, storage_backend_id: &str) -> Self {
        Self {
            backup_id: Uuid::now_v7(),
            container_ref: container_ref.to_string(),
            kind,
            compression_level: 6,
            storage_backend_id: storage_backend_id.to_string(),
            verify: true,
            include_logs: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Inspecting,
    Committing,
    Exporting,
    Verifying,
    Cataloging,
}

impl BackupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupPhase::Inspecting => "inspecting",
            BackupPhase::Committing => "committing",
            BackupPhase::Exporting => "exporting",
            BackupPhase::Verifying => "verifying",
            BackupPhase::Cataloging => "cataloging",
        }
    }
}

/// `cbkd-backup/<container>`; image repositories must be lowercase.
pub fn image_repo(container_ref: &str) -> String {
    format!("{}/{}", IMAGE_REPO_PREFIX, container_ref.to_ascii_lowercase())
}

#[derive(Clone)]
pub struct BackupManager {
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<StorageRegistry>,
    catalog: Connection,
    locks: KeyedLocks,
    tracker: OperationTracker,
    runtime_timeout: Duration,
}

impl BackupManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<StorageRegistry>,
        catalog: Connection,
        tracker: OperationTracker,
        runtime_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            storage,
            catalog,
            locks: KeyedLocks::new(),
            tracker,
            runtime_timeout,
        }
    }

    /// True while a backup of `container_ref` is in flight.
    pub fn is_locked(&self, container_ref: &str) -> bool {
        self.locks.is_held(container_ref)
    }

    /// Back up one container.
    ///
    /// Requests that fail validation, or that collide with an in-flight
    /// backup of the same container, are rejected without a record. Every
    /// other outcome leaves exactly one terminal record in the catalog.
    pub async fn create_backup(&self, req: BackupRequest) -> Result<BackupRecord, EngineError> {
        let backend = self.validate(&req).await?;

        let _guard = self
            .locks
            .try_acquire(&req.container_ref)
            .ok_or_else(|| EngineError::BackupInProgress(req.container_ref.clone()))?;

        let op = self
            .tracker
            .register(
                req.backup_id,
                OperationKind::Backup,
                &req.container_ref,
                BackupPhase::Inspecting.as_str(),
            )
            .await
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!("operation {} already running", req.backup_id))
            })?;

        info!(
            backup_id = %req.backup_id,
            container = %req.container_ref,
            kind = %req.kind,
            storage = %req.storage_backend_id,
            level = req.compression_level,
            "Starting backup"
        );

        let key = archive_key(&req.container_ref, &req.backup_id);
        let mut record = BackupRecord {
            id: req.backup_id,
            container_ref: req.container_ref.clone(),
            kind: req.kind,
            created_at: Utc::now(),
            compression_level: req.compression_level,
            checksum: None,
            size_bytes: 0,
            storage_backend_id: req.storage_backend_id.clone(),
            storage_key: key.clone(),
            status: BackupStatus::Pending,
            metadata_snapshot: None,
            image_ref: None,
            failure: None,
            verified_at: None,
            expired_at: None,
            prune_failures: 0,
        };

        let produced = self.produce(&req, backend.as_ref(), &op, &mut record).await;
        if let Some(image_ref) = &record.image_ref {
            self.discard_image(image_ref).await;
        }

        let outcome = match produced {
            Ok(()) => {
                op.set_phase(BackupPhase::Cataloging.as_str()).await;
                self.commit(backend.as_ref(), record).await
            }
            Err(err) => {
                let err = if op.is_cancelled() {
                    EngineError::Cancelled
                } else {
                    err
                };
                self.fail(backend.as_ref(), record, &err).await;
                Err(err)
            }
        };

        op.finish().await;
        outcome
    }

    async fn validate(&self, req: &BackupRequest) -> Result<Arc<dyn StorageBackend>, EngineError> {
        if !is_valid_container_name(&req.container_ref) {
            return Err(EngineError::InvalidRequest(format!(
                "invalid container reference {:?}",
                req.container_ref
            )));
        }
        if req.compression_level > 9 {
            return Err(EngineError::InvalidRequest(format!(
                "compression level {} out of range 0-9",
                req.compression_level
            )));
        }
        let backend = self.storage.get(&req.storage_backend_id).ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "unknown storage backend '{}'",
                req.storage_backend_id
            ))
        })?;
        if records::get(&self.catalog, req.backup_id)
            .await
            .map_err(EngineError::Catalog)?
            .is_some()
        {
            return Err(EngineError::InvalidRequest(format!(
                "backup id {} already cataloged",
                req.backup_id
            )));
        }
        Ok(backend)
    }

    /// Steps up to and including verification. Fills in `record` as it goes.
    async fn produce(
        &self,
        req: &BackupRequest,
        backend: &dyn StorageBackend,
        op: &OperationHandle,
        record: &mut BackupRecord,
    ) -> Result<(), EngineError> {
        let work = async {
            let snapshot = timed(
                self.runtime_timeout,
                "inspect",
                self.runtime.inspect(&req.container_ref),
            )
            .await?;
            record.metadata_snapshot = Some(snapshot.clone());

            let image: Option<ByteStream> = match req.kind {
                BackupKind::Full => {
                    op.set_phase(BackupPhase::Committing.as_str()).await;
                    let image_ref = timed(
                        self.runtime_timeout,
                        "commit_image",
                        self.runtime.commit_image(
                            &req.container_ref,
                            &image_repo(&req.container_ref),
                            &req.backup_id.to_string(),
                        ),
                    )
                    .await?;
                    record.image_ref = Some(image_ref.clone());

                    let tarball = timed(
                        self.runtime_timeout,
                        "save_image",
                        self.runtime.save_image(&image_ref),
                    )
                    .await?;
                    Some(Box::new(op.reader(tarball)) as ByteStream)
                }
                BackupKind::FilesystemOnly => None,
            };

            op.set_phase(BackupPhase::Exporting.as_str()).await;
            let filesystem = timed(
                self.runtime_timeout,
                "export_filesystem",
                self.runtime.export_filesystem(&req.container_ref),
            )
            .await?;

            let logs = if req.include_logs {
                self.log_tail(&req.container_ref)
                    .await
                    .map(|logs| Box::new(op.reader(logs)) as ByteStream)
            } else {
                None
            };

            let manifest = ArchiveManifest {
                format_version: FORMAT_VERSION,
                backup_id: req.backup_id,
                kind: req.kind,
                created_at: record.created_at,
                snapshot,
                image_ref: record.image_ref.clone(),
            };

            let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
            let (encoded, uploaded) = tokio::join!(
                encode_archive(
                    writer,
                    u32::from(req.compression_level),
                    &manifest,
                    image,
                    Box::new(op.reader(filesystem)),
                    logs,
                ),
                backend.put(&record.storage_key, Box::new(reader)),
            );
            // An upload failure also breaks the pipe under the encoder, so it wins.
            uploaded?;
            let digest = encoded?;

            record.checksum = Some(digest.checksum.clone());
            record.size_bytes = digest.size_bytes;

            if req.verify {
                op.set_phase(BackupPhase::Verifying.as_str()).await;
                let result =
                    verify_archive(backend, &record.storage_key, &digest.checksum, Some(op))
                        .await?;
                if !result.matches() {
                    return Err(EngineError::Corrupt(format!(
                        "stored archive hashes to {}, expected {}",
                        result.actual.checksum, result.expected
                    )));
                }
                record.verified_at = Some(Utc::now());
            }

            Ok::<(), EngineError>(())
        };

        tokio::select! {
            biased;
            _ = op.token().cancelled() => Err(EngineError::Cancelled),
            result = work => result,
        }
    }

    /// Recent log output, or None if the runtime cannot supply it.
    async fn log_tail(&self, container: &str) -> Option<ByteStream> {
        match timed(
            self.runtime_timeout,
            "container_logs",
            self.runtime.container_logs(container, LOG_TAIL_LINES),
        )
        .await
        {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(container = %container, error = %e, "Container logs unavailable, archiving without them");
                None
            }
        }
    }

    async fn discard_image(&self, image_ref: &str) {
        let removed = timed(
            self.runtime_timeout,
            "remove_image",
            self.runtime.remove_image(image_ref),
        )
        .await;
        match removed {
            Ok(()) => debug!(image = %image_ref, "Removed committed image"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(image = %image_ref, error = %e, "Failed to remove committed image"),
        }
    }

    async fn commit(
        &self,
        backend: &dyn StorageBackend,
        mut record: BackupRecord,
    ) -> Result<BackupRecord, EngineError> {
        record.status = BackupStatus::Verified;

        if let Err(e) = records::insert(&self.catalog, &record).await {
            error!(backup_id = %record.id, error = %e, "Failed to catalog backup, removing archive");
            if let Err(cleanup) = backend.delete(&record.storage_key).await {
                warn!(key = %record.storage_key, error = %cleanup, "Cleanup of uncataloged archive failed");
            }
            return Err(EngineError::Catalog(e));
        }

        info!(
            backup_id = %record.id,
            container = %record.container_ref,
            size_bytes = record.size_bytes,
            checksum = record.checksum.as_deref().unwrap_or_default(),
            verified = record.verified_at.is_some(),
            "Backup complete"
        );
        Ok(record)
    }

    async fn fail(&self, backend: &dyn StorageBackend, mut record: BackupRecord, err: &EngineError) {
        warn!(
            backup_id = %record.id,
            container = %record.container_ref,
            kind = %err.kind(),
            error = %err,
            "Backup failed"
        );

        if let Err(cleanup) = backend.delete(&record.storage_key).await {
            warn!(key = %record.storage_key, error = %cleanup, "Cleanup of partial archive failed");
        }

        record.status = BackupStatus::Failed;
        record.checksum = None;
        record.verified_at = None;
        record.failure = Some(FailureReason::from(err));

        if let Err(e) = records::insert(&self.catalog, &record).await {
            error!(backup_id = %record.id, error = %e, "Failed to catalog failed backup");
        }
    }

    /// Re-hash a Verified record's archive. The record is not modified.
    pub async fn verify_existing(&self, backup_id: Uuid) -> Result<VerifyResult, EngineError> {
        let record = records::get(&self.catalog, backup_id)
            .await
            .map_err(EngineError::Catalog)?
            .filter(|r| r.status != BackupStatus::Expired)
            .ok_or_else(|| EngineError::not_found("backup", backup_id.to_string()))?;

        if record.status != BackupStatus::Verified {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is {} and has no archive",
                backup_id, record.status
            )));
        }
        let expected = record
            .checksum
            .as_deref()
            .ok_or_else(|| EngineError::Corrupt(format!("backup {} has no checksum", backup_id)))?;
        let backend = self.storage.get(&record.storage_backend_id).ok_or_else(|| {
            EngineError::StorageUnavailable(format!(
                "storage backend '{}' is not configured",
                record.storage_backend_id
            ))
        })?;

        verify_archive(backend.as_ref(), &record.storage_key, expected, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_repo_is_lowercase() {
        assert_eq!(image_repo("Web_1"), "cbkd-backup/web_1");
    }

    #[test]
    fn request_defaults() {
        let req = BackupRequest::new("web1", BackupKind::Full, "disk");
        assert_eq!(req.compression_level, 6);
        assert!(req.verify);
        assert!(req.include_logs);
        assert_ne!(req.backup_id, BackupRequest::new("web1", BackupKind::Full, "disk").backup_id);
    }
}
