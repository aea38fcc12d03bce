//! Typed request and result payloads for every RPC method.
//!
//! The daemon deserializes `params` into these and the client serializes
//! them, so both ends agree on field names and defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::codec::Digest;
use crate::core::{
    BackupKind, BackupRecord, BackupStatus, ConfigOverrides, RestoreOutcome, ScheduledJob,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    DaemonStatus,
    BackupsList,
    BackupsGet,
    BackupsCreate,
    BackupsVerify,
    BackupsExpire,
    RestoreStart,
    RestorePreview,
    OperationsList,
    OperationsGet,
    OperationsCancel,
    JobsList,
    JobsRun,
    StorageList,
}

impl Method {
    pub const ALL: [Method; 14] = [
        Method::DaemonStatus,
        Method::BackupsList,
        Method::BackupsGet,
        Method::BackupsCreate,
        Method::BackupsVerify,
        Method::BackupsExpire,
        Method::RestoreStart,
        Method::RestorePreview,
        Method::OperationsList,
        Method::OperationsGet,
        Method::OperationsCancel,
        Method::JobsList,
        Method::JobsRun,
        Method::StorageList,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Method::DaemonStatus => "daemon.status",
            Method::BackupsList => "backups.list",
            Method::BackupsGet => "backups.get",
            Method::BackupsCreate => "backups.create",
            Method::BackupsVerify => "backups.verify",
            Method::BackupsExpire => "backups.expire",
            Method::RestoreStart => "restore.start",
            Method::RestorePreview => "restore.preview",
            Method::OperationsList => "operations.list",
            Method::OperationsGet => "operations.get",
            Method::OperationsCancel => "operations.cancel",
            Method::JobsList => "jobs.list",
            Method::JobsRun => "jobs.run",
            Method::StorageList => "storage.list",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL.into_iter().find(|m| m.name() == s).ok_or(())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Params of every method that addresses one backup or operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdParams {
    pub id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBackupsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// `backups.create`. Unset options fall back to the daemon's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupParams {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BackupKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub include_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<Uuid>,
    /// Reply once the backup is terminal instead of once it is accepted.
    #[serde(default = "default_true")]
    pub wait: bool,
}

impl CreateBackupParams {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            kind: None,
            storage: None,
            compression_level: None,
            verify: None,
            include_logs: true,
            backup_id: None,
            wait: true,
        }
    }
}

/// Reply to `backups.create` with `wait: false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupAccepted {
    pub backup_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreateBackupReply {
    Finished(Box<BackupRecord>),
    Accepted(BackupAccepted),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReply {
    pub id: Uuid,
    pub matches: bool,
    pub expected: String,
    pub actual: Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRestoreParams {
    pub backup_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default)]
    pub start: bool,
    #[serde(default, skip_serializing_if = "ConfigOverrides::is_empty")]
    pub overrides: ConfigOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub wait: bool,
}

impl StartRestoreParams {
    pub fn new(backup_id: Uuid) -> Self {
        Self {
            backup_id,
            new_name: None,
            start: false,
            overrides: ConfigOverrides::default(),
            operation_id: None,
            wait: true,
        }
    }
}

/// Reply to `restore.start` with `wait: false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreAccepted {
    pub operation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartRestoreReply {
    Finished(RestoreOutcome),
    Accepted(RestoreAccepted),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewParams {
    pub backup_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReply {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobReply {
    pub dispatched: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView<'a> {
    #[serde(flatten)]
    pub job: &'a ScheduledJob,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageView {
    pub id: String,
    pub kind: String,
    pub reachable: bool,
    pub error: Option<String>,
    pub free_bytes: Option<u64>,
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub active_operations: usize,
    pub jobs: usize,
    pub storage: Vec<String>,
    pub backups: BTreeMap<String, u64>,
    pub rpc_bind: String,
    pub simulation: bool,
    pub schedule_timezone: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.name().parse::<Method>(), Ok(method));
        }
        assert!("backups.purge".parse::<Method>().is_err());
    }

    #[test]
    fn create_params_omit_defaults_on_the_wire() {
        let params = CreateBackupParams::new("web1");
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({ "container": "web1", "wait": true })
        );

        let parsed: CreateBackupParams = serde_json::from_value(json!({ "container": "db" })).unwrap();
        assert!(parsed.include_logs);
        assert!(parsed.wait);
        assert!(parsed.kind.is_none());
    }

    #[test]
    fn restore_params_carry_overrides() {
        let parsed: StartRestoreParams = serde_json::from_value(json!({
            "backup_id": Uuid::nil(),
            "overrides": { "env": ["MODE=staging"] },
        }))
        .unwrap();
        assert_eq!(parsed.overrides.env, vec!["MODE=staging"]);
        assert!(!parsed.start);

        let plain = serde_json::to_value(StartRestoreParams::new(Uuid::nil())).unwrap();
        assert!(plain.get("overrides").is_none());
    }

    #[test]
    fn accepted_reply_is_told_apart_from_a_record() {
        let reply: CreateBackupReply =
            serde_json::from_value(json!({ "backup_id": Uuid::nil() })).unwrap();
        assert!(matches!(reply, CreateBackupReply::Accepted(a) if a.backup_id.is_nil()));
    }
}
