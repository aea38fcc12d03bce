//! Staging files for transfers that must be replayable or fully landed
//! before they are handed to a caller.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::ByteStream;

/// A file in the staging directory, removed on drop.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
    len: u64,
}

impl SpoolFile {
    /// Drain `data` into a new staging file.
    pub async fn write(dir: &Path, mut data: ByteStream) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = staging_path(dir, "put");
        let mut spool = SpoolFile { path, len: 0 };

        let mut file = File::create(&spool.path).await?;
        spool.len = tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;

        Ok(spool)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn open(&self) -> io::Result<ByteStream> {
        Ok(Box::new(File::open(&self.path).await?))
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn staging_path(dir: &Path, tag: &str) -> PathBuf {
    dir.join(format!("{}-{}.spool", tag, Uuid::now_v7()))
}

/// Open a downloaded staging file and unlink it; the handle keeps the data alive.
pub async fn open_detached(path: &Path) -> io::Result<ByteStream> {
    let file = File::open(path).await?;
    fs::remove_file(path).await?;
    Ok(Box::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn spool_is_replayable_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let data: ByteStream = Box::new(&b"payload bytes"[..]);

        let spool = SpoolFile::write(dir.path(), data).await.unwrap();
        assert_eq!(spool.len(), 13);

        for _ in 0..2 {
            let mut out = Vec::new();
            spool.open().await.unwrap().read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"payload bytes");
        }

        let path = spool.path().to_path_buf();
        drop(spool);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn detached_file_outlives_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = staging_path(dir.path(), "get");
        std::fs::write(&path, b"fetched").unwrap();

        let mut stream = open_detached(&path).await.unwrap();
        assert!(!path.exists());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"fetched");
    }
}
