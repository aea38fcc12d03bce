//! Retention enforcement.
//!
//! Expiry is delete-then-mark: a record only becomes Expired once its
//! payload delete succeeded. A failed delete leaves the record as it was,
//! bumps its `prune_failures` counter and is retried on the next pass.
//! Once the counter reaches the alert threshold every further failure is
//! logged at error level.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_rusqlite::Connection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{BackupRecord, BackupStatus};
use crate::db::records;
use crate::error::EngineError;
use crate::storage::StorageRegistry;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub examined: usize,
    pub expired: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Clone)]
pub struct RetentionPruner {
    catalog: Connection,
    storage: Arc<StorageRegistry>,
    alert_threshold: u32,
}

impl RetentionPruner {
    pub fn new(catalog: Connection, storage: Arc<StorageRegistry>, alert_threshold: u32) -> Self {
        Self {
            catalog,
            storage,
            alert_threshold,
        }
    }

    /// Expire every Verified/Failed record of `container_refs` created more
    /// than `retention_days` before `now`.
    pub async fn prune(
        &self,
        container_refs: &[String],
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, EngineError> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let candidates = records::list_expirable(&self.catalog, container_refs, cutoff)
            .await
            .map_err(EngineError::Catalog)?;

        let mut report = PruneReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for record in &candidates {
            match self.expire_record(record, now).await {
                Ok(()) => report.expired.push(record.id),
                Err(EngineError::Catalog(e)) => return Err(EngineError::Catalog(e)),
                Err(_) => report.failed.push(record.id),
            }
        }

        if report.examined > 0 {
            info!(
                cutoff = %cutoff,
                examined = report.examined,
                expired = report.expired.len(),
                failed = report.failed.len(),
                "Retention pass complete"
            );
        } else {
            debug!(cutoff = %cutoff, "Nothing to prune");
        }

        Ok(report)
    }

    /// Manual expiry of one record, regardless of age.
    pub async fn expire(&self, backup_id: Uuid) -> Result<BackupRecord, EngineError> {
        let record = records::get(&self.catalog, backup_id)
            .await
            .map_err(EngineError::Catalog)?
            .ok_or_else(|| EngineError::not_found("backup", backup_id.to_string()))?;

        if record.status == BackupStatus::Expired {
            return Ok(record);
        }

        self.expire_record(&record, Utc::now()).await?;

        records::get(&self.catalog, backup_id)
            .await
            .map_err(EngineError::Catalog)?
            .ok_or_else(|| EngineError::not_found("backup", backup_id.to_string()))
    }

    async fn expire_record(&self, record: &BackupRecord, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !record.status.can_transition_to(BackupStatus::Expired) {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is {} and cannot expire",
                record.id, record.status
            )));
        }

        if let Err(err) = self.delete_payload(record).await {
            let failures = records::record_prune_failure(&self.catalog, record.id)
                .await
                .map_err(EngineError::Catalog)?;

            if failures >= self.alert_threshold {
                error!(
                    backup_id = %record.id,
                    key = %record.storage_key,
                    storage = %record.storage_backend_id,
                    failures,
                    error = %err,
                    "Archive delete keeps failing; record left unexpired"
                );
            } else {
                warn!(
                    backup_id = %record.id,
                    key = %record.storage_key,
                    failures,
                    error = %err,
                    "Archive delete failed, will retry next pass"
                );
            }
            return Err(err);
        }

        let changed = records::mark_expired(&self.catalog, record.id, now)
            .await
            .map_err(EngineError::Catalog)?;
        if changed {
            info!(backup_id = %record.id, container = %record.container_ref, "Backup expired");
        }
        Ok(())
    }

    async fn delete_payload(&self, record: &BackupRecord) -> Result<(), EngineError> {
        let backend = self.storage.get(&record.storage_backend_id).ok_or_else(|| {
            EngineError::StorageUnavailable(format!(
                "storage backend '{}' is not configured",
                record.storage_backend_id
            ))
        })?;
        backend.delete(&record.storage_key).await?;
        Ok(())
    }
}
