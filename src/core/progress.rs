//! In-memory tracking for in-flight backups and restores.
//!
//! Every running operation has an entry holding its phase, a byte counter
//! and the cancellation token its I/O is bound to. Nothing here is
//! persisted; the catalog only ever sees terminal records.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::logging::LogThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

/// Point-in-time view of one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Source container for backups, target name for restores.
    pub subject: String,
    pub phase: String,
    pub bytes_processed: u64,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

struct Entry {
    kind: OperationKind,
    subject: String,
    phase: String,
    bytes: Arc<AtomicU64>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Entry {
    fn status(&self, id: Uuid) -> OperationStatus {
        OperationStatus {
            id,
            kind: self.kind,
            subject: self.subject.clone(),
            phase: self.phase.clone(),
            bytes_processed: self.bytes.load(Ordering::Relaxed),
            started_at: self.started_at,
            cancel_requested: self.cancel.is_cancelled(),
        }
    }
}

/// Shared via `AppContext`. Clones see the same table.
#[derive(Clone, Default)]
pub struct OperationTracker {
    inner: Arc<RwLock<HashMap<Uuid, Entry>>>,
    /// Parent of every operation token; cancelled on daemon shutdown.
    root: CancellationToken,
    /// Signalled whenever the table becomes empty.
    idle: Arc<Notify>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`. `None` if an operation with that id is already running.
    pub async fn register(
        &self,
        id: Uuid,
        kind: OperationKind,
        subject: &str,
        phase: &str,
    ) -> Option<OperationHandle> {
        let mut map = self.inner.write().await;
        if map.contains_key(&id) {
            return None;
        }

        let bytes = Arc::new(AtomicU64::new(0));
        let cancel = self.root.child_token();
        map.insert(
            id,
            Entry {
                kind,
                subject: subject.to_string(),
                phase: phase.to_string(),
                bytes: Arc::clone(&bytes),
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );

        Some(OperationHandle {
            id,
            bytes,
            cancel,
            tracker: self.clone(),
        })
    }

    pub async fn get(&self, id: Uuid) -> Option<OperationStatus> {
        let map = self.inner.read().await;
        map.get(&id).map(|e| e.status(id))
    }

    /// Oldest first.
    pub async fn get_all(&self) -> Vec<OperationStatus> {
        let map = self.inner.read().await;
        let mut all: Vec<OperationStatus> = map.iter().map(|(id, e)| e.status(*id)).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Request cancellation. False when no such operation is running.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let map = self.inner.read().await;
        match map.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything, including operations registered afterwards.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub async fn remove(&self, id: Uuid) {
        let mut map = self.inner.write().await;
        map.remove(&id);
        if map.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no operation is tracked. False if `limit` passes first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.active_count().await == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }

    async fn set_phase(&self, id: Uuid, phase: &str) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(&id) {
            entry.phase = phase.to_string();
        }
    }
}

/// Owned by the task running the operation.
pub struct OperationHandle {
    id: Uuid,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
    tracker: OperationTracker,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn set_phase(&self, phase: &str) {
        debug!(operation_id = %self.id, phase = %phase, "Operation phase");
        self.tracker.set_phase(self.id, phase).await;
    }

    /// Wrap a stream so its bytes count toward this operation and reads stop
    /// once it is cancelled.
    pub fn reader<R>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            operation_id: self.id,
            bytes: Arc::clone(&self.bytes),
            cancel: self.cancel.clone(),
            throttle: LogThrottle::new(Duration::from_secs(2)),
        }
    }

    /// Stop tracking. Call once the operation is terminal.
    pub async fn finish(self) {
        self.tracker.remove(self.id).await;
    }
}

pub fn cancelled_error() -> io::Error {
    io::Error::other("operation cancelled")
}

pub struct ProgressReader<R> {
    inner: R,
    operation_id: Uuid,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
    throttle: LogThrottle,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }

        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                let total = this.bytes.fetch_add(n, Ordering::Relaxed) + n;
                if n > 0 && this.throttle.should_log() {
                    debug!(operation_id = %this.operation_id, bytes = total, "Streaming");
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn register_get_and_finish() {
        let tracker = OperationTracker::new();
        let id = Uuid::now_v7();

        let handle = tracker
            .register(id, OperationKind::Backup, "web1", "inspecting")
            .await
            .unwrap();
        assert!(
            tracker
                .register(id, OperationKind::Backup, "web1", "inspecting")
                .await
                .is_none()
        );

        handle.set_phase("exporting").await;
        let status = tracker.get(id).await.unwrap();
        assert_eq!(status.phase, "exporting");
        assert_eq!(status.subject, "web1");
        assert_eq!(tracker.active_count().await, 1);

        handle.finish().await;
        assert!(tracker.get(id).await.is_none());
        assert_eq!(tracker.active_count().await, 0);
    }

    #[tokio::test]
    async fn reader_counts_bytes() {
        let tracker = OperationTracker::new();
        let id = Uuid::now_v7();
        let handle = tracker
            .register(id, OperationKind::Restore, "web1-restored", "fetching")
            .await
            .unwrap();

        let mut reader = handle.reader(&b"0123456789"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), 10);
        assert_eq!(tracker.get(id).await.unwrap().bytes_processed, 10);
    }

    #[tokio::test]
    async fn cancel_stops_reads() {
        let tracker = OperationTracker::new();
        let id = Uuid::now_v7();
        let handle = tracker
            .register(id, OperationKind::Backup, "db", "exporting")
            .await
            .unwrap();

        assert!(tracker.cancel(id).await);
        assert!(!tracker.cancel(Uuid::now_v7()).await);
        assert!(handle.is_cancelled());
        assert!(tracker.get(id).await.unwrap().cancel_requested);

        let mut reader = handle.reader(&b"data"[..]);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn cancel_all_reaches_every_operation() {
        let tracker = OperationTracker::new();
        let a = tracker
            .register(Uuid::now_v7(), OperationKind::Backup, "a", "exporting")
            .await
            .unwrap();
        tracker.cancel_all();
        let b = tracker
            .register(Uuid::now_v7(), OperationKind::Backup, "b", "exporting")
            .await
            .unwrap();

        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_returns_once_operations_finish() {
        let tracker = OperationTracker::new();
        assert!(tracker.wait_idle(Duration::from_secs(1)).await);

        let handle = tracker
            .register(Uuid::now_v7(), OperationKind::Backup, "web1", "exporting")
            .await
            .unwrap();
        tokio::spawn(async move {
            handle.token().cancelled().await;
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle.finish().await;
        });

        tracker.cancel_all();
        assert!(!tracker.wait_idle(Duration::from_secs(1)).await);
        assert!(tracker.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(tracker.active_count().await, 0);
    }
}
