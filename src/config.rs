//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then `cbkd.toml` (or the file
//! given with `--config`), then `CBKD_*` environment variables (nested keys
//! split on `__`, e.g. `CBKD_RETRY__MAX_ATTEMPTS`), then CLI flags.
//! Everything is validated once at load time; an invalid cron expression
//! or an unknown storage id aborts startup instead of failing at due time.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::models::{BackupKind, is_valid_container_name};
use crate::core::scheduler::{CronSchedule, ScheduleZone, ScheduledJob};

pub const DEFAULT_CONFIG_FILE: &str = "cbkd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub staging_dir: PathBuf,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub max_concurrent_jobs: usize,
    pub default_compression_level: u8,
    /// Backend used when a request names none.
    pub default_storage: Option<String>,
    pub verify_backups: bool,
    pub runtime_timeout_secs: u64,
    /// How long shutdown waits for cancelled operations to finish.
    pub shutdown_grace_secs: u64,
    /// Zone cron expressions are evaluated in: "local", "utc", or a fixed
    /// offset such as "+02:00".
    pub schedule_timezone: String,
    pub docker_socket: Option<String>,
    /// Consecutive failed payload deletes before pruning logs an alert.
    pub prune_alert_threshold: u32,
    pub retry: RetryConfig,
    pub storage: Vec<StorageConfig>,
    pub jobs: Vec<JobConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("cbkd.db"),
            staging_dir: std::env::temp_dir().join("cbkd-staging"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            simulation: false,
            verbose: false,
            json_logs: false,
            max_concurrent_jobs: 2,
            default_compression_level: 6,
            default_storage: None,
            verify_backups: true,
            runtime_timeout_secs: 300,
            shutdown_grace_secs: 30,
            schedule_timezone: "local".to_string(),
            docker_socket: None,
            prune_alert_threshold: 3,
            retry: RetryConfig::default(),
            storage: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            attempt_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Local { id: String, path: PathBuf },
    Nfs(NfsConfig),
    Ssh(SshConfig),
    S3(S3Config),
}

impl StorageConfig {
    pub fn id(&self) -> &str {
        match self {
            StorageConfig::Local { id, .. } => id,
            StorageConfig::Nfs(c) => &c.id,
            StorageConfig::Ssh(c) => &c.id,
            StorageConfig::S3(c) => &c.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsConfig {
    pub id: String,
    pub server: String,
    pub export: String,
    pub mount_point: PathBuf,
    #[serde(default = "default_nfs_options")]
    pub options: String,
    /// Run `mount` when the share is not mounted yet.
    #[serde(default)]
    pub auto_mount: bool,
}

fn default_nfs_options() -> String {
    "vers=4,rw".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub id: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub remote_path: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub id: String,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for MinIO and other S3-compatible stores.
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub path_style: bool,
}

fn default_s3_prefix() -> String {
    "cbkd/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Five-field cron expression.
    pub schedule: String,
    pub containers: Vec<String>,
    pub kind: BackupKind,
    pub storage: String,
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub compression_level: Option<u8>,
    pub verify: Option<bool>,
    #[serde(default = "default_true")]
    pub include_logs: bool,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load and validate. `overrides` are CLI flags serialized with
    /// `skip_serializing_if = "Option::is_none"` so unset flags don't clobber.
    pub fn load<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        if config_file.is_some() && !file.exists() {
            bail!("Config file not found: {}", file.display());
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("CBKD_").split("__"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn schedule_zone(&self) -> Result<ScheduleZone> {
        self.schedule_timezone
            .parse()
            .with_context(|| format!("invalid schedule_timezone '{}'", self.schedule_timezone))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.default_compression_level > 9 {
            bail!(
                "default_compression_level {} out of range 0-9",
                self.default_compression_level
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        self.schedule_zone()?;

        let mut storage_ids = HashSet::new();
        for storage in &self.storage {
            let id = storage.id();
            if id.is_empty() {
                bail!("storage entries need a non-empty id");
            }
            if !storage_ids.insert(id) {
                bail!("duplicate storage id '{}'", id);
            }
        }

        if let Some(default) = &self.default_storage {
            if !storage_ids.contains(default.as_str()) {
                bail!("default_storage '{}' is not a configured storage id", default);
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if !job_names.insert(job.name.as_str()) {
                bail!("duplicate job name '{}'", job.name);
            }
            if !storage_ids.contains(job.storage.as_str()) {
                bail!("job '{}' uses unknown storage '{}'", job.name, job.storage);
            }
            CronSchedule::parse(&job.schedule)
                .with_context(|| format!("job '{}' has an invalid schedule", job.name))?;
            if job.containers.is_empty() {
                bail!("job '{}' lists no containers", job.name);
            }
            if let Some(bad) = job.containers.iter().find(|c| !is_valid_container_name(c)) {
                bail!("job '{}' has invalid container name '{}'", job.name, bad);
            }
            if job.retention_days == 0 {
                bail!("job '{}' needs retention_days of at least 1", job.name);
            }
            if job.compression_level.is_some_and(|l| l > 9) {
                bail!("job '{}' compression_level out of range 0-9", job.name);
            }
        }

        Ok(())
    }

    /// Jobs with defaults applied and schedules parsed.
    pub fn scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let zone = self.schedule_zone()?;
        self.jobs
            .iter()
            .map(|job| {
                Ok(ScheduledJob {
                    name: job.name.clone(),
                    schedule: CronSchedule::parse(&job.schedule)?.in_zone(zone),
                    container_refs: job.containers.clone(),
                    backup_kind: job.kind,
                    storage_backend_id: job.storage.clone(),
                    retention_days: job.retention_days,
                    enabled: job.enabled,
                    compression_level: job
                        .compression_level
                        .unwrap_or(self.default_compression_level),
                    verify: job.verify.unwrap_or(self.verify_backups),
                    include_logs: job.include_logs,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    const BASE: &str = r#"
        [[storage]]
        kind = "local"
        id = "disk"
        path = "/var/lib/cbkd/archives"

        [[storage]]
        kind = "s3"
        id = "offsite"
        bucket = "backups"
        region = "eu-west-1"

        [[jobs]]
        name = "nightly"
        schedule = "30 2 * * *"
        containers = ["web1", "db"]
        kind = "full"
        storage = "disk"
        retention_days = 14
    "#;

    #[test]
    fn parses_storage_variants_and_jobs() {
        let config = parse(BASE).unwrap();

        assert_eq!(config.storage.len(), 2);
        assert!(matches!(config.storage[0], StorageConfig::Local { .. }));
        match &config.storage[1] {
            StorageConfig::S3(s3) => {
                assert_eq!(s3.prefix, "cbkd/");
                assert!(!s3.path_style);
            }
            other => panic!("unexpected storage {:?}", other),
        }

        let jobs = config.scheduled_jobs().unwrap();
        assert_eq!(jobs[0].container_refs, vec!["web1", "db"]);
        assert!(jobs[0].enabled);
        assert_eq!(jobs[0].compression_level, 6);
        assert!(jobs[0].verify);
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.runtime_timeout(), Duration::from_secs(300));
        assert_eq!(config.rpc_bind.port(), 7420);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.schedule_zone().unwrap(), ScheduleZone::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn schedule_timezone_is_validated() {
        let toml = format!("schedule_timezone = \"+02:00\"\n{}", BASE);
        let config = parse(&toml).unwrap();
        let zone = config.schedule_zone().unwrap();
        assert!(matches!(zone, ScheduleZone::Fixed(_)));
        let jobs = config.scheduled_jobs().unwrap();
        assert_eq!(jobs[0].schedule.zone(), zone);
        assert!(jobs[0].include_logs);

        let toml = format!("schedule_timezone = \"Mars/Olympus\"\n{}", BASE);
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn rejects_invalid_cron_at_load() {
        let toml = BASE.replace("30 2 * * *", "61 2 * * *");
        let err = parse(&toml).unwrap_err();
        assert!(format!("{:#}", err).contains("nightly"));
    }

    #[test]
    fn rejects_unknown_storage() {
        let toml = BASE.replace(r#"storage = "disk""#, r#"storage = "tape""#);
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let toml = format!(
            "{}\n{}",
            BASE,
            r#"
            [[jobs]]
            name = "nightly"
            schedule = "0 * * * *"
            containers = ["cache"]
            kind = "filesystem_only"
            storage = "offsite"
            retention_days = 3
            "#
        );
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn rejects_bad_compression_level() {
        let toml = BASE.replace("retention_days = 14", "retention_days = 14\ncompression_level = 12");
        assert!(parse(&toml).is_err());
    }
}
