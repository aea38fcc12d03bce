use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::spool::SpoolFile;
use super::{ByteStream, StorageBackend, StorageError};
use crate::config::RetryConfig;

/// Bounded exponential backoff around `Unavailable`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per attempt. An attempt that overruns counts as `Unavailable`.
    pub attempt_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(n-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, op: &str, key: &str, mut attempt_fn: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Unavailable(format!(
                    "{} {} timed out after {:?}",
                    op, key, self.attempt_timeout
                ))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        op,
                        key = %key,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Wraps a network backend with [`RetryPolicy`].
///
/// Upload streams can only be read once, so `put` spools them to the
/// staging directory first and replays the file on each attempt.
pub struct RetryingBackend {
    inner: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    staging_dir: PathBuf,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, policy: RetryPolicy, staging_dir: PathBuf) -> Self {
        Self {
            inner,
            policy,
            staging_dir,
        }
    }
}

#[async_trait]
impl StorageBackend for RetryingBackend {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn put(&self, key: &str, data: ByteStream) -> Result<(), StorageError> {
        let spool = SpoolFile::write(&self.staging_dir, data).await?;
        let spool = &spool;
        self.policy
            .run("put", key, || async move {
                let stream = spool.open().await?;
                self.inner.put(key, stream).await
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.policy.run("get", key, || self.inner.get(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.policy.run("list", prefix, || self.inner.list(prefix)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.policy.run("delete", key, || self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.policy.run("exists", key, || self.inner.exists(key)).await
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        self.policy
            .run("test_connection", "", || self.inner.test_connection())
            .await
    }

    async fn available_space(&self) -> Result<Option<u64>, StorageError> {
        self.policy
            .run("available_space", "", || self.inner.available_space())
            .await
    }
}
