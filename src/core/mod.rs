pub mod backup;
pub mod codec;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod restore;
pub mod retention;
pub mod runtime;
pub mod scheduler;
pub mod verifier;

pub use backup::{BackupManager, BackupRequest};
pub use models::{
    BackupKind, BackupRecord, BackupStatus, ConfigOverrides, ContainerHandle, ContainerSnapshot,
};
pub use orchestrator::Orchestrator;
pub use progress::{OperationKind, OperationStatus, OperationTracker};
pub use restore::{RestoreManager, RestoreOutcome, RestorePreview, RestoreRequest};
pub use retention::{PruneReport, RetentionPruner};
pub use runtime::{ContainerRuntime, RuntimeError};
pub use scheduler::{Clock, CronSchedule, JobRunner, ScheduleZone, ScheduledJob, Scheduler};
