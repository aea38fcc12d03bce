use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tracing::debug;

use super::{ByteStream, StorageBackend, StorageError, validate_key};

const PARTIAL_SUFFIX: &str = ".partial";

/// Archives as plain files under a root directory.
///
/// Writes land in `<key>.partial` and are renamed into place after fsync,
/// so a reader never observes a half-written archive under its final key.
pub struct LocalBackend {
    root: PathBuf,
    /// Set when the root sits on a network mount.
    network: bool,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            network: false,
        }
    }

    pub(crate) fn on_network_mount(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            network: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn classify(&self, err: io::Error, key: &str) -> StorageError {
        StorageError::from_io(err, key, self.network)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn walk(root: &Path) -> io::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                continue;
            }

            if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }

    Ok(keys)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, mut data: ByteStream) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let partial = partial_path(&path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.classify(e, key))?;
        }

        let written = async {
            let mut file = File::create(&partial).await?;
            let bytes = tokio::io::copy(&mut data, &mut file).await?;
            file.sync_all().await?;
            fs::rename(&partial, &path).await?;
            Ok::<u64, io::Error>(bytes)
        }
        .await;

        match written {
            Ok(bytes) => {
                debug!(key = %key, bytes, "Archive written");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(self.classify(e, key))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.path_for(key)?;
        let file = File::open(&path).await.map_err(|e| self.classify(e, key))?;
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let walked = tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            walk(&root)
        })
        .await
        .map_err(|e| StorageError::Io(io::Error::other(e)))?;

        let mut keys: Vec<String> = walked
            .map_err(|e| self.classify(e, prefix))?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        let _ = fs::remove_file(partial_path(&path)).await;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.classify(e, key)),
        }

        // Drop now-empty `{container}/{backup_id}` directories.
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root.as_path() || fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| self.classify(e, key))
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.classify(e, &self.root.to_string_lossy()))
    }

    async fn available_space(&self) -> Result<Option<u64>, StorageError> {
        let root = self.root.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(root.as_path()))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
            .map_err(|errno| self.classify(io::Error::from(errno), "."))?;

        Ok(Some(
            stat.blocks_available() as u64 * stat.fragment_size() as u64,
        ))
    }
}
