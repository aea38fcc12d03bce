//! Restore orchestration.
//!
//! A restore never writes to the catalog and takes no container locks. The
//! archive is staged and hashed before anything touches the runtime, so a
//! corrupt or unreachable archive fails without side effects. A container
//! created by a restore that is cancelled before population begins is
//! removed again; one cancelled while being populated is left in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use super::codec::{ARCHIVE_EXTENSION, DecodedArchive, decode_archive};
use super::models::{
    BackupKind, BackupRecord, BackupStatus, ConfigOverrides, ContainerHandle, ContainerSnapshot,
    is_valid_container_name,
};
use super::progress::{OperationHandle, OperationKind, OperationTracker};
use super::runtime::{ContainerRuntime, timed};
use super::verifier::copy_and_hash;
use crate::db::records;
use crate::error::EngineError;
use crate::storage::{StorageBackend, StorageRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Tracker id, so callers can cancel.
    pub operation_id: Uuid,
    pub backup_id: Uuid,
    pub new_name: Option<String>,
    pub start_after: bool,
    /// Merged over the captured configuration before the container is created.
    #[serde(default)]
    pub overrides: ConfigOverrides,
}

impl RestoreRequest {
    pub fn new(backup_id: Uuid) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            backup_id,
            new_name: None,
            start_after: false,
            overrides: ConfigOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Fetching,
    Verifying,
    ConflictCheck,
    Recreating,
    Populating,
    Starting,
    Done,
    Failed,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Fetching => "fetching",
            RestorePhase::Verifying => "verifying",
            RestorePhase::ConflictCheck => "conflict_check",
            RestorePhase::Recreating => "recreating",
            RestorePhase::Populating => "populating",
            RestorePhase::Starting => "starting",
            RestorePhase::Done => "done",
            RestorePhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub operation_id: Uuid,
    pub backup_id: Uuid,
    pub container: ContainerHandle,
    pub started: bool,
    /// Start failures do not fail the restore.
    pub start_error: Option<String>,
}

/// What a restore would do, computed without side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePreview {
    pub backup_id: Uuid,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub target_name: String,
    pub image_ref: String,
    pub image_embedded: bool,
    pub image_present: bool,
    pub name_conflict: bool,
    pub env_count: usize,
    pub mount_count: usize,
    pub port_count: usize,
    pub network_count: usize,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct RestoreManager {
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<StorageRegistry>,
    catalog: Connection,
    tracker: OperationTracker,
    runtime_timeout: Duration,
    staging_dir: PathBuf,
}

impl RestoreManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<StorageRegistry>,
        catalog: Connection,
        tracker: OperationTracker,
        runtime_timeout: Duration,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            storage,
            catalog,
            tracker,
            runtime_timeout,
            staging_dir,
        }
    }

    /// Restorable record: present, not Expired, with an archive and snapshot.
    async fn load_record(&self, backup_id: Uuid) -> Result<(BackupRecord, ContainerSnapshot), EngineError> {
        let record = records::get(&self.catalog, backup_id)
            .await
            .map_err(EngineError::Catalog)?
            .filter(|r| r.status != BackupStatus::Expired)
            .ok_or_else(|| EngineError::not_found("backup", backup_id.to_string()))?;

        if record.status != BackupStatus::Verified {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is {} and cannot be restored",
                backup_id, record.status
            )));
        }
        let snapshot = record.metadata_snapshot.clone().ok_or_else(|| {
            EngineError::Corrupt(format!("backup {} has no metadata snapshot", backup_id))
        })?;
        Ok((record, snapshot))
    }

    fn target_name(new_name: Option<&str>, snapshot: &ContainerSnapshot) -> Result<String, EngineError> {
        let target = new_name.unwrap_or(&snapshot.container_ref).to_string();
        if !is_valid_container_name(&target) {
            return Err(EngineError::InvalidRequest(format!(
                "invalid container name {:?}",
                target
            )));
        }
        Ok(target)
    }

    pub async fn restore(&self, req: RestoreRequest) -> Result<RestoreOutcome, EngineError> {
        let (record, snapshot) = self.load_record(req.backup_id).await?;
        let target = Self::target_name(req.new_name.as_deref(), &snapshot)?;

        let op = self
            .tracker
            .register(
                req.operation_id,
                OperationKind::Restore,
                &target,
                RestorePhase::Fetching.as_str(),
            )
            .await
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "operation {} already running",
                    req.operation_id
                ))
            })?;

        info!(
            operation_id = %req.operation_id,
            backup_id = %record.id,
            target = %target,
            kind = %record.kind,
            "Starting restore"
        );

        let stage = self.staging_dir.join(format!("restore-{}", req.operation_id));
        let result = match tokio::fs::create_dir_all(&stage).await {
            Ok(()) => {
                self.run(&req, &record, &snapshot, &target, &stage, &op)
                    .await
            }
            Err(e) => Err(EngineError::Io(e)),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&stage).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %stage.display(), error = %e, "Failed to remove restore staging");
            }
        }

        let result = match result {
            Err(_) if op.is_cancelled() => Err(EngineError::Cancelled),
            other => other,
        };
        match &result {
            Ok(outcome) => {
                op.set_phase(RestorePhase::Done.as_str()).await;
                info!(
                    operation_id = %req.operation_id,
                    container = %outcome.container.name,
                    started = outcome.started,
                    "Restore complete"
                );
            }
            Err(e) => {
                op.set_phase(RestorePhase::Failed.as_str()).await;
                warn!(
                    operation_id = %req.operation_id,
                    backup_id = %record.id,
                    kind = %e.kind(),
                    error = %e,
                    "Restore failed"
                );
            }
        }

        op.finish().await;
        result
    }

    async fn run(
        &self,
        req: &RestoreRequest,
        record: &BackupRecord,
        snapshot: &ContainerSnapshot,
        target: &str,
        stage: &Path,
        op: &OperationHandle,
    ) -> Result<RestoreOutcome, EngineError> {
        let backend = self.storage.get(&record.storage_backend_id).ok_or_else(|| {
            EngineError::StorageUnavailable(format!(
                "storage backend '{}' is not configured",
                record.storage_backend_id
            ))
        })?;

        let staged = tokio::select! {
            biased;
            _ = op.token().cancelled() => return Err(EngineError::Cancelled),
            staged = self.fetch_and_decode(record, backend.as_ref(), stage, op) => staged?,
        };

        op.set_phase(RestorePhase::ConflictCheck.as_str()).await;
        if timed(self.runtime_timeout, "name_exists", self.runtime.name_exists(target)).await? {
            return Err(EngineError::NameConflict(target.to_string()));
        }

        op.set_phase(RestorePhase::Recreating.as_str()).await;
        let image = self.ensure_image(record, snapshot, &staged, op).await?;
        if op.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let config = if req.overrides.is_empty() {
            snapshot.clone()
        } else {
            req.overrides.apply(snapshot)
        };
        let container = timed(
            self.runtime_timeout,
            "create_container",
            self.runtime.create_container(target, &image, &config),
        )
        .await?;
        info!(container = %container.name, id = %container.id, image = %image, "Container created");

        if op.is_cancelled() {
            self.discard_container(target).await;
            return Err(EngineError::Cancelled);
        }

        // From here on a failure leaves the created container in place.
        op.set_phase(RestorePhase::Populating.as_str()).await;
        let populate = async {
            let tarball = tokio::fs::File::open(&staged.filesystem).await?;
            timed(
                self.runtime_timeout,
                "put_archive",
                self.runtime
                    .put_archive(target, Box::new(op.reader(tarball)), "/"),
            )
            .await
            .map_err(EngineError::from)
        };
        let injected = tokio::select! {
            biased;
            _ = op.token().cancelled() => return Err(EngineError::Cancelled),
            injected = populate => injected?,
        };
        if !injected {
            return Err(EngineError::InjectionFailed(target.to_string()));
        }

        let mut started = false;
        let mut start_error = None;
        if req.start_after {
            op.set_phase(RestorePhase::Starting.as_str()).await;
            match timed(self.runtime_timeout, "start", self.runtime.start(target)).await {
                Ok(()) => started = true,
                Err(e) => {
                    warn!(container = %target, error = %e, "Restored container failed to start");
                    start_error = Some(e.to_string());
                }
            }
        }

        Ok(RestoreOutcome {
            operation_id: req.operation_id,
            backup_id: record.id,
            container,
            started,
            start_error,
        })
    }

    async fn discard_container(&self, name: &str) {
        match timed(
            self.runtime_timeout,
            "remove_container",
            self.runtime.remove_container(name),
        )
        .await
        {
            Ok(()) => info!(container = %name, "Removed container of cancelled restore"),
            Err(e) => warn!(container = %name, error = %e, "Failed to remove container of cancelled restore"),
        }
    }

    /// Fetch into `stage`, compare checksums, then split the archive into its sections.
    async fn fetch_and_decode(
        &self,
        record: &BackupRecord,
        backend: &dyn StorageBackend,
        stage: &Path,
        op: &OperationHandle,
    ) -> Result<DecodedArchive, EngineError> {
        let expected = record.checksum.as_deref().ok_or_else(|| {
            EngineError::Corrupt(format!("backup {} has no checksum", record.id))
        })?;

        let archive_path = stage.join(format!("archive.{}", ARCHIVE_EXTENSION));
        let stream = backend.get(&record.storage_key).await?;
        let mut file = tokio::fs::File::create(&archive_path).await?;
        let digest = copy_and_hash(op.reader(stream), Some(&mut file)).await?;
        drop(file);

        op.set_phase(RestorePhase::Verifying.as_str()).await;
        if digest.checksum != expected {
            return Err(EngineError::Corrupt(format!(
                "archive hashes to {}, catalog has {}",
                digest.checksum, expected
            )));
        }

        let out_dir = stage.to_path_buf();
        let decoded = tokio::task::spawn_blocking(move || decode_archive(&archive_path, &out_dir))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

        if decoded.manifest.backup_id != record.id || decoded.manifest.kind != record.kind {
            return Err(EngineError::Corrupt(format!(
                "archive belongs to backup {} ({}), not {} ({})",
                decoded.manifest.backup_id, decoded.manifest.kind, record.id, record.kind
            )));
        }
        Ok(decoded)
    }

    /// Image the new container will run. Full archives load their embedded
    /// image; FilesystemOnly archives need it present already.
    async fn ensure_image(
        &self,
        record: &BackupRecord,
        snapshot: &ContainerSnapshot,
        staged: &DecodedArchive,
        op: &OperationHandle,
    ) -> Result<String, EngineError> {
        match record.kind {
            BackupKind::Full => {
                let image_ref = staged
                    .manifest
                    .image_ref
                    .clone()
                    .or_else(|| record.image_ref.clone())
                    .ok_or_else(|| {
                        EngineError::Corrupt(format!("backup {} has no image reference", record.id))
                    })?;
                let image_path = staged.image.as_ref().ok_or_else(|| {
                    EngineError::Corrupt(format!("backup {} has no image section", record.id))
                })?;

                let tarball = tokio::fs::File::open(image_path).await?;
                timed(
                    self.runtime_timeout,
                    "load_image",
                    self.runtime.load_image(Box::new(op.reader(tarball))),
                )
                .await?;

                if !timed(self.runtime_timeout, "image_exists", self.runtime.image_exists(&image_ref))
                    .await?
                {
                    return Err(EngineError::ImageNotFound(image_ref));
                }
                Ok(image_ref)
            }
            BackupKind::FilesystemOnly => {
                let image_ref = snapshot.image.clone();
                if !timed(self.runtime_timeout, "image_exists", self.runtime.image_exists(&image_ref))
                    .await?
                {
                    return Err(EngineError::ImageNotFound(image_ref));
                }
                Ok(image_ref)
            }
        }
    }

    pub async fn preview(
        &self,
        backup_id: Uuid,
        new_name: Option<&str>,
    ) -> Result<RestorePreview, EngineError> {
        let (record, snapshot) = self.load_record(backup_id).await?;
        let target_name = Self::target_name(new_name, &snapshot)?;

        let (image_ref, image_embedded) = match record.kind {
            BackupKind::Full => (
                record.image_ref.clone().unwrap_or_else(|| snapshot.image.clone()),
                true,
            ),
            BackupKind::FilesystemOnly => (snapshot.image.clone(), false),
        };

        let image_present =
            timed(self.runtime_timeout, "image_exists", self.runtime.image_exists(&image_ref))
                .await?;
        let name_conflict =
            timed(self.runtime_timeout, "name_exists", self.runtime.name_exists(&target_name))
                .await?;

        Ok(RestorePreview {
            backup_id,
            kind: record.kind,
            created_at: record.created_at,
            target_name,
            image_ref,
            image_embedded,
            image_present,
            name_conflict,
            env_count: snapshot.env.len(),
            mount_count: snapshot.mounts.len(),
            port_count: snapshot.ports.len(),
            network_count: snapshot.networks.len(),
            size_bytes: record.size_bytes,
        })
    }
}
