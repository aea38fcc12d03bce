//! Cron-driven job dispatch.
//!
//! One scheduling task sleeps until the earliest due job, hands due jobs to
//! a bounded worker pool and goes back to sleep. A job whose previous run is
//! still going when it comes due again is skipped, not queued. Within a run
//! containers are backed up one after another, then retention is applied.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backup::{BackupManager, BackupRequest};
use super::locks::KeyedLocks;
use super::models::BackupKind;
use super::retention::{PruneReport, RetentionPruner};
use crate::error::ErrorKind;

/// Longest single sleep; wall-clock jumps are noticed within this bound.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("unsupported day-of-week field {0:?}")]
    DayOfWeek(String),
    #[error("unknown time zone {0:?}, expected \"local\", \"utc\" or an offset like \"+02:00\"")]
    Zone(String),
    #[error(transparent)]
    Cron(#[from] cron::error::Error),
}

/// Wall clock that cron fields are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleZone {
    /// The host's zone, DST included.
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl FromStr for ScheduleZone {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ScheduleZone::Local),
            "utc" | "z" => Ok(ScheduleZone::Utc),
            other => other
                .parse::<FixedOffset>()
                .map(ScheduleZone::Fixed)
                .map_err(|_| ScheduleError::Zone(s.to_string())),
        }
    }
}

/// A five-field cron expression.
///
/// Day-of-week uses POSIX numbering (0 or 7 = Sunday). When both
/// day-of-month and day-of-week are restricted, a day matching either one
/// fires, as in cron(8).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// Two entries when day-of-month and day-of-week are alternatives.
    schedules: Vec<cron::Schedule>,
    zone: ScheduleZone,
}

impl CronSchedule {
    /// Parse for evaluation in the host's local zone.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let dow = convert_day_of_week(dow)?;

        let build = |dom: &str, dow: &str| {
            cron::Schedule::from_str(&format!("0 {} {} {} {} {}", minute, hour, dom, month, dow))
        };
        let schedules = if dom.starts_with('*') || dow.starts_with('*') {
            vec![build(dom, &dow)?]
        } else {
            vec![build(dom, "*")?, build("*", &dow)?]
        };

        Ok(Self {
            expression: fields.join(" "),
            schedules,
            zone: ScheduleZone::default(),
        })
    }

    pub fn in_zone(mut self, zone: ScheduleZone) -> Self {
        self.zone = zone;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.zone {
            ScheduleZone::Local => self.first_after(&after.with_timezone(&Local)),
            ScheduleZone::Utc => self.first_after(&after),
            ScheduleZone::Fixed(offset) => self.first_after(&after.with_timezone(&offset)),
        }
    }

    fn first_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(after).next())
            .map(|due| due.with_timezone(&Utc))
            .min()
    }
}

impl Serialize for CronSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

fn dow_number(token: &str) -> Result<Option<u32>, ScheduleError> {
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        return match token.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(Some(n)),
            _ => Err(ScheduleError::DayOfWeek(token.to_string())),
        };
    }
    if token == "*" || token.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(None);
    }
    Err(ScheduleError::DayOfWeek(token.to_string()))
}

/// POSIX 0-7 (Sunday = 0 or 7) to the cron crate's 1-7 (Sunday = 1).
/// Names and `*` pass through.
fn convert_day_of_week(field: &str) -> Result<String, ScheduleError> {
    let bad = || ScheduleError::DayOfWeek(field.to_string());
    let mut items = Vec::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let converted = match base.split_once('-') {
            Some((lo, hi)) => match (dow_number(lo)?, dow_number(hi)?) {
                (Some(lo), Some(hi)) if lo > hi => return Err(bad()),
                (Some(0), Some(7)) => "1-7".to_string(),
                (Some(lo), Some(7)) => {
                    // Wraps past Saturday onto Sunday.
                    if step.is_some() {
                        return Err(bad());
                    }
                    items.push("1".to_string());
                    format!("{}-7", lo + 1)
                }
                (Some(lo), Some(hi)) => format!("{}-{}", lo + 1, hi + 1),
                (None, None) => base.to_string(),
                _ => return Err(bad()),
            },
            None => match dow_number(base)? {
                Some(n) => (n % 7 + 1).to_string(),
                None => base.to_string(),
            },
        };

        match step {
            Some(step) => items.push(format!("{}/{}", converted, step)),
            None => items.push(converted),
        }
    }

    Ok(items.join(","))
}

/// A job as the scheduler runs it, defaults applied.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub container_refs: Vec<String>,
    pub backup_kind: BackupKind,
    pub storage_backend_id: String,
    pub retention_days: u32,
    pub enabled: bool,
    pub compression_level: u8,
    pub verify: bool,
    pub include_logs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub container_ref: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunSummary {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<JobFailure>,
    pub prune: Option<PruneReport>,
}

/// Executes job runs on a bounded pool.
#[derive(Clone)]
pub struct JobRunner {
    backups: BackupManager,
    pruner: RetentionPruner,
    pool: Arc<Semaphore>,
    running: KeyedLocks,
}

impl JobRunner {
    pub fn new(backups: BackupManager, pruner: RetentionPruner, max_concurrent_jobs: usize) -> Self {
        Self {
            backups,
            pruner,
            pool: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            running: KeyedLocks::new(),
        }
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.running.is_held(job_name)
    }

    /// Start a run in the background. False if the job is already running.
    pub fn try_dispatch(&self, job: ScheduledJob) -> bool {
        let Some(guard) = self.running.try_acquire(&job.name) else {
            return false;
        };

        let runner = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = runner.pool.clone().acquire_owned().await else {
                return;
            };
            runner.run_job(&job).await;
        });
        true
    }

    /// One full run: every container in order, then retention.
    pub async fn run_job(&self, job: &ScheduledJob) -> JobRunSummary {
        let started_at = Utc::now();
        info!(job = %job.name, containers = job.container_refs.len(), "Job run starting");

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for container in &job.container_refs {
            let req = BackupRequest {
                backup_id: Uuid::now_v7(),
                container_ref: container.clone(),
                kind: job.backup_kind,
                compression_level: job.compression_level,
                storage_backend_id: job.storage_backend_id.clone(),
                verify: job.verify,
                include_logs: job.include_logs,
            };

            match self.backups.create_backup(req).await {
                Ok(record) => succeeded.push(record.id),
                Err(e) => {
                    warn!(job = %job.name, container = %container, error = %e, "Job backup failed");
                    failed.push(JobFailure {
                        container_ref: container.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let prune = match self
            .pruner
            .prune(&job.container_refs, job.retention_days, Utc::now())
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                error!(job = %job.name, error = %e, "Retention pass failed");
                None
            }
        };

        let summary = JobRunSummary {
            job: job.name.clone(),
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            prune,
        };

        info!(
            job = %summary.job,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            expired = summary.prune.as_ref().map_or(0, |p| p.expired.len()),
            "Job run finished"
        );
        summary
    }
}

/// Source of "now" for due-time checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    runner: JobRunner,
    clock: Clock,
}

impl Scheduler {
    pub fn new(jobs: Vec<ScheduledJob>, runner: JobRunner) -> Self {
        Self {
            jobs,
            runner,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until `shutdown` fires. In-flight job runs are not awaited.
    pub async fn run(self, shutdown: CancellationToken) {
        let now = (self.clock)();
        let mut next: Vec<(usize, DateTime<Utc>)> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.enabled)
            .filter_map(|(idx, job)| job.schedule.next_after(now).map(|due| (idx, due)))
            .collect();

        for (idx, due) in &next {
            info!(job = %self.jobs[*idx].name, next_run = %due, "Job scheduled");
        }

        loop {
            let Some(earliest) = next.iter().map(|(_, due)| *due).min() else {
                info!("No scheduled jobs, scheduler idle");
                shutdown.cancelled().await;
                return;
            };

            let wait = (earliest - (self.clock)()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait.min(MAX_SLEEP)) => {}
            }

            let now = (self.clock)();
            next = next
                .into_iter()
                .filter_map(|(idx, due)| {
                    if due > now {
                        return Some((idx, due));
                    }

                    let job = &self.jobs[idx];
                    if self.runner.try_dispatch(job.clone()) {
                        debug!(job = %job.name, "Job dispatched");
                    } else {
                        warn!(job = %job.name, "Previous run still in progress, skipping");
                    }

                    let following = job.schedule.next_after(now);
                    if following.is_none() {
                        warn!(job = %job.name, "Schedule has no further fire times");
                    }
                    following.map(|due| (idx, due))
                })
                .collect();
        }
    }
}
