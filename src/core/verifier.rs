//! Checksum verification of stored archives.
//!
//! Archives are hashed as they stream back from storage. Nothing is
//! buffered whole; restores tee the bytes into a staging file on the way.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::codec::{Digest, format_checksum};
use super::progress::OperationHandle;
use crate::error::EngineError;
use crate::storage::{ByteStream, StorageBackend};

const CHUNK: usize = 128 * 1024;

/// Outcome of re-hashing a stored archive.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub expected: String,
    pub actual: Digest,
}

impl VerifyResult {
    pub fn matches(&self) -> bool {
        self.actual.checksum == self.expected
    }
}

/// Hash everything `stream` yields, copying it into `sink` when given.
pub async fn copy_and_hash<R, W>(mut stream: R, mut sink: Option<&mut W>) -> std::io::Result<Digest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if let Some(sink) = sink.as_mut() {
            sink.write_all(&buf[..n]).await?;
        }
        total += n as u64;
    }

    if let Some(sink) = sink.as_mut() {
        sink.flush().await?;
    }

    Ok(Digest {
        checksum: format_checksum(&hasher.finalize()),
        size_bytes: total,
    })
}

pub async fn hash_stream<R: AsyncRead + Unpin>(stream: R) -> std::io::Result<Digest> {
    copy_and_hash::<R, tokio::io::Sink>(stream, None).await
}

/// Re-read `key` from `backend` and compare against `expected`.
///
/// Reads go through the operation's progress reader when one is given, so a
/// cancelled operation stops hashing.
pub async fn verify_archive(
    backend: &dyn StorageBackend,
    key: &str,
    expected: &str,
    op: Option<&OperationHandle>,
) -> Result<VerifyResult, EngineError> {
    debug!(key = %key, backend = backend.kind(), "Re-reading archive for verification");

    let stream: ByteStream = backend.get(key).await?;
    let actual = match op {
        Some(op) => hash_stream(op.reader(stream)).await,
        None => hash_stream(stream).await,
    };
    let actual = match actual {
        Ok(digest) => digest,
        Err(_) if op.is_some_and(|op| op.is_cancelled()) => return Err(EngineError::Cancelled),
        Err(e) => return Err(EngineError::Io(e)),
    };

    let result = VerifyResult {
        expected: expected.to_string(),
        actual,
    };

    if result.matches() {
        info!(key = %key, size_bytes = result.actual.size_bytes, "Archive checksum verified");
    } else {
        warn!(
            key = %key,
            expected = %result.expected,
            actual = %result.actual.checksum,
            "Archive checksum mismatch"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;
    use tempfile::TempDir;

    fn checksum_of(data: &[u8]) -> String {
        format_checksum(&blake3::hash(data))
    }

    #[tokio::test]
    async fn hash_matches_one_shot_hash() {
        let data = vec![42u8; CHUNK * 2 + 17];
        let digest = hash_stream(&data[..]).await.unwrap();

        assert_eq!(digest.checksum, checksum_of(&data));
        assert_eq!(digest.size_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn copy_and_hash_tees_into_sink() {
        let mut sink = Vec::new();
        let digest = copy_and_hash(&b"payload"[..], Some(&mut sink)).await.unwrap();

        assert_eq!(sink, b"payload");
        assert_eq!(digest.checksum, checksum_of(b"payload"));
    }

    #[tokio::test]
    async fn verify_archive_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend
            .put("web1/a/archive.cbk.gz", Box::new(&b"original"[..]))
            .await
            .unwrap();

        let ok = verify_archive(&backend, "web1/a/archive.cbk.gz", &checksum_of(b"original"), None)
            .await
            .unwrap();
        assert!(ok.matches());

        std::fs::write(dir.path().join("web1/a/archive.cbk.gz"), b"tampered").unwrap();
        let bad = verify_archive(&backend, "web1/a/archive.cbk.gz", &checksum_of(b"original"), None)
            .await
            .unwrap();
        assert!(!bad.matches());
    }

    #[tokio::test]
    async fn verify_missing_archive_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());

        let err = verify_archive(&backend, "web1/a/archive.cbk.gz", "blake3:00", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
