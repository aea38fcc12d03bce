//! Container runtime capability set consumed by the engine.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::models::{ContainerHandle, ContainerSnapshot};
use crate::storage::ByteStream;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container or image: {0}")]
    NotFound(String),
    #[error("runtime call {0} timed out")]
    Timeout(String),
    #[error("{0}")]
    Api(String),
}

/// Stateless facade over the container runtime. The engine never speaks the
/// runtime's protocol itself.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, container: &str) -> Result<ContainerSnapshot, RuntimeError>;

    /// Tarball of the container's filesystem.
    async fn export_filesystem(&self, container: &str) -> Result<ByteStream, RuntimeError>;

    /// Commit the container as `repo:tag`; returns the new image reference.
    async fn commit_image(
        &self,
        container: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, RuntimeError>;

    /// Image tarball suitable for `load_image`.
    async fn save_image(&self, image: &str) -> Result<ByteStream, RuntimeError>;

    async fn load_image(&self, tarball: ByteStream) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// The last `tail` lines of stdout and stderr, timestamped.
    async fn container_logs(&self, container: &str, tail: usize) -> Result<ByteStream, RuntimeError>;

    /// Create (not start) a container named `name` from `image` using the
    /// captured env, mounts, ports and networks.
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        snapshot: &ContainerSnapshot,
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Extract a tarball into the container at `path`. `Ok(false)` means the
    /// runtime refused or did not complete the write.
    async fn put_archive(
        &self,
        container: &str,
        tarball: ByteStream,
        path: &str,
    ) -> Result<bool, RuntimeError>;

    async fn name_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn start(&self, container: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, container: &str) -> Result<(), RuntimeError>;
}

/// Bound a runtime call. Overrunning is a hard failure, never retried here.
pub async fn timed<T, F>(limit: Duration, op: &str, fut: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RuntimeError::Timeout(op.to_string()))?
}
