use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureReason;

static CONTAINER_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").ok());

/// Container names as the runtime accepts them. Also safe as a storage key segment.
pub fn is_valid_container_name(name: &str) -> bool {
    CONTAINER_NAME
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Committed image + metadata + filesystem.
    Full,
    /// Metadata + filesystem; restore needs the image locally.
    FilesystemOnly,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::FilesystemOnly => "filesystem_only",
        }
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "filesystem_only" | "filesystem" => Ok(BackupKind::FilesystemOnly),
            other => Err(format!("unknown backup kind: {}", other)),
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Verified,
    Failed,
    Expired,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Verified => "verified",
            BackupStatus::Failed => "failed",
            BackupStatus::Expired => "expired",
        }
    }

    /// Pending resolves exactly once; Expired is the only move after that.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (BackupStatus::Pending, BackupStatus::Verified)
                | (BackupStatus::Pending, BackupStatus::Failed)
                | (BackupStatus::Verified, BackupStatus::Expired)
                | (BackupStatus::Failed, BackupStatus::Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::Pending)
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "verified" => Ok(BackupStatus::Verified),
            "failed" => Ok(BackupStatus::Failed),
            "expired" => Ok(BackupStatus::Expired),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// "bind", "volume", "tmpfs"
    pub kind: String,
    /// Host path for binds, volume name for volumes.
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// e.g. "80/tcp"
    pub container_port: String,
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// Container configuration captured at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub container_ref: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
    pub state: String,
}

/// Settings merged over a captured snapshot when restoring. Absent fields
/// keep the captured value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    /// `KEY=VALUE` entries; an entry replaces the captured one with the same key.
    pub env: Vec<String>,
    /// Merged over the captured labels.
    pub labels: BTreeMap<String, String>,
    pub mounts: Option<Vec<MountSpec>>,
    pub ports: Option<Vec<PortSpec>>,
    pub networks: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, snapshot: &ContainerSnapshot) -> ContainerSnapshot {
        let mut merged = snapshot.clone();

        for entry in &self.env {
            let key = env_key(entry);
            match merged.env.iter_mut().find(|e| env_key(e) == key) {
                Some(existing) => *existing = entry.clone(),
                None => merged.env.push(entry.clone()),
            }
        }
        merged
            .labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(mounts) = &self.mounts {
            merged.mounts = mounts.clone();
        }
        if let Some(ports) = &self.ports {
            merged.ports = ports.clone();
        }
        if let Some(networks) = &self.networks {
            merged.networks = networks.clone();
        }
        if let Some(command) = &self.command {
            merged.command = command.clone();
        }
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub container_ref: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub compression_level: u8,
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub storage_backend_id: String,
    pub storage_key: String,
    pub status: BackupStatus,
    pub metadata_snapshot: Option<ContainerSnapshot>,
    /// Committed image, Full backups only.
    pub image_ref: Option<String>,
    pub failure: Option<FailureReason>,
    pub verified_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub prune_failures: u32,
}

/// Handle returned by the runtime after creating a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_record_lifecycle() {
        use BackupStatus::*;
        assert!(Pending.can_transition_to(Verified));
        assert!(Pending.can_transition_to(Failed));
        assert!(Verified.can_transition_to(Expired));
        assert!(Failed.can_transition_to(Expired));

        assert!(!Verified.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Verified));
        assert!(!Expired.can_transition_to(Verified));
        assert!(!Pending.can_transition_to(Expired));
    }

    fn snapshot() -> ContainerSnapshot {
        ContainerSnapshot {
            container_ref: "web1".into(),
            image: "nginx:1.27".into(),
            env: vec!["TZ=UTC".into(), "MODE=prod".into()],
            mounts: vec![],
            ports: vec![PortSpec {
                container_port: "80/tcp".into(),
                host_ip: None,
                host_port: Some("8080".into()),
            }],
            networks: vec!["bridge".into()],
            labels: BTreeMap::from([("tier".into(), "web".into())]),
            command: vec![],
            state: "running".into(),
        }
    }

    #[test]
    fn overrides_merge_env_and_labels_by_key() {
        let overrides = ConfigOverrides {
            env: vec!["MODE=staging".into(), "DEBUG=1".into()],
            labels: BTreeMap::from([("owner".into(), "ops".into())]),
            ..Default::default()
        };
        let merged = overrides.apply(&snapshot());

        assert_eq!(merged.env, vec!["TZ=UTC", "MODE=staging", "DEBUG=1"]);
        assert_eq!(merged.labels.len(), 2);
        assert_eq!(merged.labels["tier"], "web");
        assert_eq!(merged.ports, snapshot().ports);
        assert_eq!(merged.networks, vec!["bridge"]);
    }

    #[test]
    fn overrides_replace_list_settings() {
        let overrides = ConfigOverrides {
            ports: Some(vec![]),
            networks: Some(vec!["backend".into()]),
            command: Some(vec!["nginx".into(), "-t".into()]),
            ..Default::default()
        };
        assert!(!overrides.is_empty());
        assert!(ConfigOverrides::default().is_empty());

        let merged = overrides.apply(&snapshot());
        assert!(merged.ports.is_empty());
        assert_eq!(merged.networks, vec!["backend"]);
        assert_eq!(merged.command, vec!["nginx", "-t"]);
        assert_eq!(merged.env, snapshot().env);
    }

    #[test]
    fn overrides_deserialize_from_partial_json() {
        let overrides: ConfigOverrides =
            serde_json::from_str(r#"{"env": ["A=1"], "networks": ["x"]}"#).unwrap();
        assert_eq!(overrides.env, vec!["A=1"]);
        assert!(overrides.ports.is_none());
        assert_eq!(overrides.networks, Some(vec!["x".to_string()]));
    }

    #[test]
    fn container_names() {
        for ok in ["web1", "db-primary", "app_v2.1", "A"] {
            assert!(is_valid_container_name(ok), "{}", ok);
        }
        for bad in ["", "-web", ".hidden", "web/1", "web 1", "../etc"] {
            assert!(!is_valid_container_name(bad), "{}", bad);
        }
    }

    #[test]
    fn kind_accepts_short_filesystem_alias() {
        assert_eq!(
            "filesystem".parse::<BackupKind>().unwrap(),
            BackupKind::FilesystemOnly
        );
        assert_eq!("full".parse::<BackupKind>().unwrap(), BackupKind::Full);
        assert!("delta".parse::<BackupKind>().is_err());
    }
}
