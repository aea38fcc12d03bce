//! End-to-end backup and restore against the simulated runtime and a
//! local storage directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cbkd::adapters::{SimulatedRuntime, demo_snapshot};
use cbkd::core::codec::decode_archive;
use cbkd::core::{
    BackupKind, BackupManager, BackupRequest, BackupStatus, ContainerRuntime, OperationTracker,
    RestoreManager, RestoreRequest,
};
use cbkd::db::{self, records};
use cbkd::error::ErrorKind;
use cbkd::storage::{
    ByteStream, LocalBackend, RetryPolicy, RetryingBackend, StorageBackend, StorageError,
    StorageRegistry,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_rusqlite::Connection;

const STORAGE: &str = "disk";

/// Local storage that flips the last byte of every archive it hands back.
struct Corrupting {
    inner: Arc<LocalBackend>,
}

#[async_trait]
impl StorageBackend for Corrupting {
    fn kind(&self) -> &'static str {
        "corrupting"
    }

    async fn put(&self, key: &str, data: ByteStream) -> Result<(), StorageError> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let mut bytes = Vec::new();
        self.inner
            .get(key)
            .await?
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| StorageError::from_io(e, key, false))?;
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }
}

struct Harness {
    runtime: SimulatedRuntime,
    backend: Arc<LocalBackend>,
    db: Connection,
    tracker: OperationTracker,
    backups: BackupManager,
    restores: RestoreManager,
    dir: TempDir,
}

async fn harness() -> Harness {
    harness_with(|local, _| local).await
}

/// Harness whose registered backend is `wrap` applied to the local one.
async fn harness_with(
    wrap: impl FnOnce(Arc<LocalBackend>, &Path) -> Arc<dyn StorageBackend>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalBackend::new(dir.path().join("archives")));
    let mut storage = StorageRegistry::new();
    storage.insert(STORAGE, wrap(backend.clone(), dir.path()));
    let storage = Arc::new(storage);

    let runtime = SimulatedRuntime::new();
    runtime
        .add_container(demo_snapshot("web1", "nginx:1.27"), b"index.html\n".repeat(20_000))
        .await;

    let db = db::init_in_memory().await.unwrap();
    let tracker = OperationTracker::new();
    let shared: Arc<dyn ContainerRuntime> = Arc::new(runtime.clone());
    let timeout = Duration::from_secs(30);

    let backups = BackupManager::new(
        shared.clone(),
        storage.clone(),
        db.clone(),
        tracker.clone(),
        timeout,
    );
    let restores = RestoreManager::new(
        shared,
        storage,
        db.clone(),
        tracker.clone(),
        timeout,
        dir.path().join("staging"),
    );

    Harness {
        runtime,
        backend,
        db,
        tracker,
        backups,
        restores,
        dir,
    }
}

async fn wait_for_phase(tracker: &OperationTracker, phase: &str) -> uuid::Uuid {
    for _ in 0..500 {
        if let Some(op) = tracker.get_all().await.into_iter().find(|op| op.phase == phase) {
            return op.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no operation reached phase {}", phase);
}

#[tokio::test]
async fn full_backup_restores_under_new_name() {
    let h = harness().await;
    let original = h.runtime.inspect("web1").await.unwrap();

    let images = h.runtime.image_names().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::Full, STORAGE))
        .await
        .unwrap();
    assert_eq!(record.status, BackupStatus::Verified);
    // The committed image lives on only inside the archive.
    assert_eq!(h.runtime.image_names().await, images);
    assert!(record.verified_at.is_some());
    assert!(record.checksum.is_some());
    assert!(record.size_bytes > 0);
    assert_eq!(
        record.image_ref.as_deref(),
        Some(format!("cbkd-backup/web1:{}", record.id).as_str())
    );
    assert!(h.backend.exists(&record.storage_key).await.unwrap());

    let stored = records::get(&h.db, record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Verified);
    assert_eq!(stored.checksum, record.checksum);
    assert_eq!(stored.metadata_snapshot, record.metadata_snapshot);

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-restored".to_string());
    req.start_after = true;
    let outcome = h.restores.restore(req).await.unwrap();
    assert_eq!(outcome.container.name, "web1-restored");
    assert_eq!(
        Some(outcome.container.id.clone()),
        h.runtime.container_id("web1-restored").await
    );
    assert!(outcome.started);
    assert!(outcome.start_error.is_none());

    let restored = h.runtime.inspect("web1-restored").await.unwrap();
    assert_eq!(restored.env, original.env);
    assert_eq!(restored.mounts, original.mounts);
    assert_eq!(restored.ports, original.ports);
    assert_eq!(restored.networks, original.networks);
    assert_eq!(restored.labels, original.labels);
    assert_eq!(restored.image, record.image_ref.clone().unwrap());

    assert_eq!(
        h.runtime.filesystem("web1-restored").await,
        h.runtime.filesystem("web1").await
    );
    assert!(h.runtime.is_running("web1-restored").await);
    assert!(h.tracker.get_all().await.is_empty());
}

#[tokio::test]
async fn restore_into_existing_name_conflicts() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();

    let err = h
        .restores
        .restore(RestoreRequest::new(record.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-copy".to_string());
    let outcome = h.restores.restore(req).await.unwrap();
    assert!(!outcome.started);
    assert_eq!(
        h.runtime.inspect("web1-copy").await.unwrap().image,
        "nginx:1.27"
    );
}

#[tokio::test]
async fn filesystem_only_restore_needs_base_image() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();
    assert!(record.image_ref.is_none());

    h.runtime.remove_image("nginx:1.27").await.unwrap();

    let preview = h
        .restores
        .preview(record.id, Some("web1-new"))
        .await
        .unwrap();
    assert!(!preview.image_present);
    assert!(!preview.image_embedded);
    assert!(!preview.name_conflict);

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-new".to_string());
    let err = h.restores.restore(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageNotFound);

    assert!(!h.runtime.container_names().await.contains(&"web1-new".to_string()));
    let stored = records::get(&h.db, record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Verified);
}

#[tokio::test]
async fn cancel_during_export_leaves_failed_record_and_no_archive() {
    let h = harness().await;
    h.runtime
        .add_container(demo_snapshot("big", "nginx:1.27"), vec![7u8; 2 * 1024 * 1024])
        .await;
    h.runtime
        .set_export_delay(Some(Duration::from_millis(20)))
        .await;

    let req = BackupRequest::new("big", BackupKind::FilesystemOnly, STORAGE);
    let backup_id = req.backup_id;
    let backups = h.backups.clone();
    let task = tokio::spawn(async move { backups.create_backup(req).await });

    let op = wait_for_phase(&h.tracker, "exporting").await;
    assert_eq!(op, backup_id);
    assert!(h.tracker.cancel(op).await);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let stored = records::get(&h.db, backup_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Failed);
    assert_eq!(stored.failure.unwrap().kind, ErrorKind::Cancelled);
    assert!(stored.checksum.is_none());
    assert!(!h.backend.exists(&stored.storage_key).await.unwrap());
    assert!(!h.backups.is_locked("big"));
}

#[tokio::test]
async fn second_backup_of_same_container_is_rejected() {
    let h = harness().await;
    h.runtime
        .set_export_delay(Some(Duration::from_millis(20)))
        .await;

    let first = BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE);
    let backups = h.backups.clone();
    let task = tokio::spawn(async move { backups.create_backup(first).await });

    wait_for_phase(&h.tracker, "exporting").await;
    assert!(h.backups.is_locked("web1"));

    let second = BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE);
    let second_id = second.backup_id;
    let err = h.backups.create_backup(second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackupInProgress);
    assert!(records::get(&h.db, second_id).await.unwrap().is_none());

    let record = task.await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Verified);
}

#[tokio::test]
async fn invalid_requests_leave_no_record() {
    let h = harness().await;

    let bad_name = BackupRequest::new("../etc", BackupKind::Full, STORAGE);
    let bad_name_id = bad_name.backup_id;
    let err = h.backups.create_backup(bad_name).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(records::get(&h.db, bad_name_id).await.unwrap().is_none());

    let err = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::Full, "nowhere"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let mut level = BackupRequest::new("web1", BackupKind::Full, STORAGE);
    level.compression_level = 12;
    let err = h.backups.create_backup(level).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn missing_container_is_cataloged_as_failed() {
    let h = harness().await;
    let req = BackupRequest::new("ghost", BackupKind::Full, STORAGE);
    let id = req.backup_id;

    let err = h.backups.create_backup(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let stored = records::get(&h.db, id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Failed);
    assert_eq!(stored.failure.unwrap().kind, ErrorKind::NotFound);

    // Failed records are not restorable.
    let err = h.restores.restore(RestoreRequest::new(id)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn tampered_archive_fails_verification_and_restore() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();

    let check = h.backups.verify_existing(record.id).await.unwrap();
    assert!(check.matches());

    let path = h.backend.root().join(&record.storage_key);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let check = h.backups.verify_existing(record.id).await.unwrap();
    assert!(!check.matches());

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-bad".to_string());
    let err = h.restores.restore(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert!(!h.runtime.container_names().await.contains(&"web1-bad".to_string()));
}

#[tokio::test]
async fn failed_injection_keeps_created_container() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();
    h.runtime.set_fail_injection(true).await;

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-partial".to_string());
    req.start_after = true;
    let err = h.restores.restore(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectionFailed);

    assert!(h.runtime.container_names().await.contains(&"web1-partial".to_string()));
    assert!(!h.runtime.is_running("web1-partial").await);
}

#[tokio::test]
async fn start_failure_is_reported_not_raised() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::Full, STORAGE))
        .await
        .unwrap();
    h.runtime.set_fail_start(true).await;

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-stopped".to_string());
    req.start_after = true;
    let outcome = h.restores.restore(req).await.unwrap();
    assert!(!outcome.started);
    assert!(outcome.start_error.is_some());
    assert_eq!(
        h.runtime.filesystem("web1-stopped").await,
        h.runtime.filesystem("web1").await
    );
}

#[tokio::test]
async fn unverified_backup_has_no_verified_at() {
    let h = harness().await;
    let mut req = BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE);
    req.verify = false;
    let record = h.backups.create_backup(req).await.unwrap();
    assert_eq!(record.status, BackupStatus::Verified);
    assert!(record.verified_at.is_none());
    assert!(record.checksum.is_some());
}

#[tokio::test]
async fn cancel_during_create_removes_the_container() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();
    h.runtime
        .set_create_delay(Some(Duration::from_millis(300)))
        .await;

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-late".to_string());
    let operation_id = req.operation_id;
    let restores = h.restores.clone();
    let task = tokio::spawn(async move { restores.restore(req).await });

    let op = wait_for_phase(&h.tracker, "recreating").await;
    assert_eq!(op, operation_id);
    assert!(h.tracker.cancel(op).await);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!h.runtime.container_names().await.contains(&"web1-late".to_string()));
    assert!(h.tracker.get_all().await.is_empty());
}

#[tokio::test]
async fn corrupted_upload_fails_verification() {
    let h = harness_with(|local, _| Arc::new(Corrupting { inner: local })).await;
    let images = h.runtime.image_names().await;

    let req = BackupRequest::new("web1", BackupKind::Full, STORAGE);
    let id = req.backup_id;
    let err = h.backups.create_backup(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);

    let stored = records::get(&h.db, id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Failed);
    assert_eq!(stored.failure.unwrap().kind, ErrorKind::Corrupt);
    assert!(stored.checksum.is_none());
    assert!(!h.backend.exists(&stored.storage_key).await.unwrap());
    assert_eq!(h.runtime.image_names().await, images);
}

#[tokio::test]
async fn retrying_backend_round_trip_leaves_no_spool() {
    let h = harness_with(|local, dir| {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(10),
        };
        Arc::new(RetryingBackend::new(local, policy, dir.join("spool")))
    })
    .await;

    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::Full, STORAGE))
        .await
        .unwrap();
    assert_eq!(record.status, BackupStatus::Verified);
    assert!(h.backend.exists(&record.storage_key).await.unwrap());

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-retried".to_string());
    h.restores.restore(req).await.unwrap();
    assert_eq!(
        h.runtime.filesystem("web1-retried").await,
        h.runtime.filesystem("web1").await
    );

    let spool = h.dir.path().join("spool");
    let leftovers = std::fs::read_dir(&spool)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "spool"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn archive_carries_log_tail_unless_disabled() {
    let h = harness().await;
    h.runtime.log_line("web1", "GET /index.html 200").await;

    let with_logs = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();
    let out = tempfile::tempdir().unwrap();
    let decoded = decode_archive(&h.backend.root().join(&with_logs.storage_key), out.path()).unwrap();
    let logs = std::fs::read_to_string(decoded.logs.unwrap()).unwrap();
    assert!(logs.contains("web1 started from nginx:1.27"), "{}", logs);
    assert!(logs.ends_with("GET /index.html 200\n"), "{}", logs);

    let mut req = BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE);
    req.include_logs = false;
    let without = h.backups.create_backup(req).await.unwrap();
    let out = tempfile::tempdir().unwrap();
    let decoded = decode_archive(&h.backend.root().join(&without.storage_key), out.path()).unwrap();
    assert!(decoded.logs.is_none());
}

#[tokio::test]
async fn restore_applies_config_overrides() {
    let h = harness().await;
    let record = h
        .backups
        .create_backup(BackupRequest::new("web1", BackupKind::FilesystemOnly, STORAGE))
        .await
        .unwrap();

    let mut req = RestoreRequest::new(record.id);
    req.new_name = Some("web1-staging".to_string());
    req.overrides.env = vec!["SERVICE_NAME=web1-staging".to_string()];
    req.overrides.networks = Some(vec!["staging".to_string()]);
    req.overrides.command = Some(vec!["nginx".to_string(), "-t".to_string()]);
    h.restores.restore(req).await.unwrap();

    let restored = h.runtime.inspect("web1-staging").await.unwrap();
    assert_eq!(restored.env, vec!["SERVICE_NAME=web1-staging", "TZ=UTC"]);
    assert_eq!(restored.networks, vec!["staging"]);
    assert_eq!(restored.command, vec!["nginx", "-t"]);
    // Untouched settings come from the captured snapshot.
    assert_eq!(restored.ports, h.runtime.inspect("web1").await.unwrap().ports);

    // The catalog keeps the captured configuration.
    let stored = records::get(&h.db, record.id).await.unwrap().unwrap();
    assert_eq!(stored.metadata_snapshot.unwrap().networks, vec!["bridge"]);
}
