use std::path::PathBuf;

use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::spool::{open_detached, staging_path};
use super::{ByteStream, StorageBackend, StorageError, validate_key};
use crate::config::S3Config;

/// Archives in an S3-compatible bucket under a key prefix.
pub struct S3Backend {
    bucket: Box<Bucket>,
    prefix: String,
    staging_dir: PathBuf,
}

impl S3Backend {
    pub fn new(config: S3Config, staging_dir: PathBuf) -> anyhow::Result<Self> {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) => {
                Credentials::new(Some(access.as_str()), Some(secret.as_str()), None, None, None)?
            }
            // env vars -> ~/.aws/credentials -> instance metadata
            _ => Credentials::default()?,
        };

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config.region.parse()?,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)?;
        let bucket = if config.path_style || config.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            prefix: normalize_prefix(&config.prefix),
            staging_dir,
        })
    }

    fn full_key(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn classify(err: S3Error, key: &str) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(403, body) => {
            StorageError::PermissionDenied(format!("{}: {}", key, body))
        }
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        other => {
            let msg = other.to_string();
            if msg.contains("NoSuchKey") {
                StorageError::NotFound(key.to_string())
            } else if msg.contains("AccessDenied") || msg.contains("InvalidAccessKeyId") {
                StorageError::PermissionDenied(format!("{}: {}", key, msg))
            } else {
                StorageError::Unavailable(format!("{}: {}", key, msg))
            }
        }
    }
}

fn classify_status(code: u16, key: &str) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        403 => Err(StorageError::PermissionDenied(key.to_string())),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::Unavailable(format!(
            "{}: HTTP {}",
            key, other
        ))),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, mut data: ByteStream) -> Result<(), StorageError> {
        let full_key = self.full_key(key)?;
        self.bucket
            .put_object_stream(&mut data, &full_key)
            .await
            .map_err(|e| classify(e, key))?;
        debug!(key = %full_key, "S3 put object successful");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let full_key = self.full_key(key)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let local = staging_path(&self.staging_dir, "s3-get");

        let mut file = tokio::fs::File::create(&local).await?;
        let fetched = self
            .bucket
            .get_object_to_writer(&full_key, &mut file)
            .await
            .map_err(|e| classify(e, key))
            .and_then(|status| classify_status(status, key));
        let flushed = file.flush().await;
        drop(file);

        if let Err(e) = fetched.and(flushed.map_err(StorageError::Io)) {
            let _ = tokio::fs::remove_file(&local).await;
            return Err(e);
        }

        Ok(open_detached(&local).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let search = format!("{}{}", self.prefix, prefix);
        let pages = self
            .bucket
            .list(search, None)
            .await
            .map_err(|e| classify(e, prefix))?;

        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter_map(|obj| obj.key.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| !k.is_empty())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key)?;
        match self.bucket.delete_object(&full_key).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full_key = self.full_key(key)?;
        match self.bucket.head_object(&full_key).await {
            Ok((_, status)) => match classify_status(status, key) {
                Ok(()) => Ok(true),
                Err(StorageError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            Err(e) => match classify(e, key) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
