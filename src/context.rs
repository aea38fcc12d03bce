use std::sync::Arc;

use anyhow::Result;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::runtime::ContainerRuntime;
use crate::core::{
    BackupManager, JobRunner, OperationTracker, RestoreManager, RetentionPruner, ScheduledJob,
};
use crate::storage::StorageRegistry;

/// Everything the daemon's surfaces share. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub storage: Arc<StorageRegistry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tracker: OperationTracker,
    pub backups: BackupManager,
    pub restores: RestoreManager,
    pub pruner: RetentionPruner,
    pub runner: JobRunner,
    pub jobs: Arc<Vec<ScheduledJob>>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        storage: StorageRegistry,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let jobs = config.scheduled_jobs()?;
        let storage = Arc::new(storage);
        let tracker = OperationTracker::new();

        let backups = BackupManager::new(
            runtime.clone(),
            storage.clone(),
            db.clone(),
            tracker.clone(),
            config.runtime_timeout(),
        );
        let restores = RestoreManager::new(
            runtime.clone(),
            storage.clone(),
            db.clone(),
            tracker.clone(),
            config.runtime_timeout(),
            config.staging_dir.clone(),
        );
        let pruner = RetentionPruner::new(db.clone(), storage.clone(), config.prune_alert_threshold);
        let runner = JobRunner::new(backups.clone(), pruner.clone(), config.max_concurrent_jobs);

        Ok(Self {
            config: Arc::new(config),
            db,
            storage,
            runtime,
            tracker,
            backups,
            restores,
            pruner,
            runner,
            jobs: Arc::new(jobs),
        })
    }

    pub fn job(&self, name: &str) -> Option<&ScheduledJob> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
