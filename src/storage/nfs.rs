use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{ByteStream, LocalBackend, StorageBackend, StorageError};
use crate::config::NfsConfig;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Archives on an NFS share, accessed through its local mount point.
///
/// Every operation first checks that the share is still mounted so that a
/// dropped mount never results in archives silently landing on the local
/// disk underneath the mount point. An unmounted share is `Unavailable`
/// until it comes back, or until `auto_mount` manages to mount it.
pub struct NfsBackend {
    config: NfsConfig,
    files: LocalBackend,
}

impl NfsBackend {
    pub fn new(config: NfsConfig) -> Self {
        Self {
            files: LocalBackend::on_network_mount(config.mount_point.clone()),
            config,
        }
    }

    /// Check the mount now, mounting it if configured to.
    pub async fn attach(&self) -> Result<(), StorageError> {
        self.ensure_mounted().await
    }

    fn source(&self) -> String {
        format!("{}:{}", self.config.server, self.config.export)
    }

    async fn is_mounted(&self) -> Result<bool, StorageError> {
        let mountinfo = tokio::fs::read_to_string(MOUNTINFO)
            .await
            .map_err(StorageError::Io)?;
        let target = tokio::fs::canonicalize(&self.config.mount_point)
            .await
            .unwrap_or_else(|_| self.config.mount_point.clone());

        Ok(mount_points(&mountinfo).any(|p| p == target))
    }

    async fn mount(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.config.mount_point).await?;

        info!(
            source = %self.source(),
            mount_point = %self.config.mount_point.display(),
            "Mounting NFS share"
        );
        let output = Command::new("mount")
            .arg("-t")
            .arg("nfs")
            .arg("-o")
            .arg(&self.config.options)
            .arg(self.source())
            .arg(&self.config.mount_point)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(source = %self.source(), error = %stderr.trim(), "NFS mount failed");
            return Err(StorageError::Unavailable(format!(
                "mount {} failed: {}",
                self.source(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn ensure_mounted(&self) -> Result<(), StorageError> {
        if self.is_mounted().await? {
            return Ok(());
        }
        if self.config.auto_mount {
            return self.mount().await;
        }
        Err(StorageError::Unavailable(format!(
            "{} is not mounted",
            self.config.mount_point.display()
        )))
    }

    pub fn mount_point(&self) -> &Path {
        &self.config.mount_point
    }
}

/// Mount points listed in a mountinfo table (field 5, octal escapes decoded).
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl StorageBackend for NfsBackend {
    fn kind(&self) -> &'static str {
        "nfs"
    }

    async fn put(&self, key: &str, data: ByteStream) -> Result<(), StorageError> {
        self.ensure_mounted().await?;
        self.files.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.ensure_mounted().await?;
        self.files.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_mounted().await?;
        self.files.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_mounted().await?;
        self.files.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_mounted().await?;
        self.files.exists(key).await
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        self.ensure_mounted().await
    }

    async fn available_space(&self) -> Result<Option<u64>, StorageError> {
        self.ensure_mounted().await?;
        self.files.available_space().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw
98 22 0:52 / /mnt/backups rw,relatime shared:60 - nfs4 nas01:/export/backups rw,vers=4.2
99 22 0:53 / /mnt/with\\040space rw,relatime shared:61 - nfs4 nas01:/export/other rw
";

    #[test]
    fn finds_mount_points() {
        let points: Vec<PathBuf> = mount_points(SAMPLE).collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/mnt/backups"),
                PathBuf::from("/mnt/with space"),
            ]
        );
    }

    #[test]
    fn unescape_leaves_plain_text_alone() {
        assert_eq!(unescape_mount_field("/srv/data"), "/srv/data");
        assert_eq!(unescape_mount_field("/a\\011b"), "/a\tb");
        assert_eq!(unescape_mount_field("/trailing\\"), "/trailing\\");
    }

    #[tokio::test]
    async fn unmounted_share_without_auto_mount_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = NfsConfig {
            id: "nas".into(),
            server: "nas01".into(),
            export: "/export/backups".into(),
            mount_point: dir.path().join("not-a-mount"),
            options: "vers=4,rw".into(),
            auto_mount: false,
        };

        let backend = NfsBackend::new(config);
        assert!(matches!(backend.attach().await, Err(StorageError::Unavailable(_))));
        assert!(matches!(
            backend.exists("web1/a/archive.cbk.gz").await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(!backend.mount_point().exists());
    }
}
