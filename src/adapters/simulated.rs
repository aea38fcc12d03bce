//! In-memory container runtime.
//!
//! Backs `--simulation` runs and the test suite. Filesystems and images are
//! opaque byte blobs; the handle is cheap to clone and every clone shares
//! the same state, so tests keep one handle as a controller while the
//! engine drives another.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

use crate::core::models::{ContainerHandle, ContainerSnapshot};
use crate::core::runtime::{ContainerRuntime, RuntimeError};
use crate::storage::ByteStream;

const EXPORT_CHUNK: usize = 16 * 1024;
const IMAGE_HEADER: &str = "SIMIMG1";

struct SimContainer {
    id: String,
    snapshot: ContainerSnapshot,
    filesystem: Vec<u8>,
    logs: Vec<String>,
    running: bool,
}

#[derive(Default)]
struct SimState {
    containers: HashMap<String, SimContainer>,
    images: HashMap<String, Vec<u8>>,
    next_id: u64,
    fail_injection: bool,
    fail_start: bool,
    export_chunk_delay: Option<Duration>,
    create_delay: Option<Duration>,
}

impl SimState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("sim{:012x}", self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct SimulatedRuntime {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container; its image is registered too if missing.
    pub async fn add_container(&self, snapshot: ContainerSnapshot, filesystem: Vec<u8>) {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state
            .images
            .entry(snapshot.image.clone())
            .or_insert_with(|| format!("base layers of {}", snapshot.image).into_bytes());

        let running = snapshot.state == "running";
        let logs = vec![format!(
            "{} {} started from {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            snapshot.container_ref,
            snapshot.image
        )];
        state.containers.insert(
            snapshot.container_ref.clone(),
            SimContainer {
                id,
                snapshot,
                filesystem,
                logs,
                running,
            },
        );
    }

    pub async fn add_image(&self, image: &str) {
        self.state
            .lock()
            .await
            .images
            .entry(image.to_string())
            .or_insert_with(|| format!("base layers of {}", image).into_bytes());
    }

    pub async fn set_fail_injection(&self, fail: bool) {
        self.state.lock().await.fail_injection = fail;
    }

    pub async fn set_fail_start(&self, fail: bool) {
        self.state.lock().await.fail_start = fail;
    }

    /// Slow exports down so tests can cancel mid-stream.
    pub async fn set_export_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.export_chunk_delay = delay;
    }

    /// Hold `create_container` for `delay` before it takes effect.
    pub async fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.create_delay = delay;
    }

    pub async fn log_line(&self, name: &str, line: &str) {
        if let Some(c) = self.state.lock().await.containers.get_mut(name) {
            c.logs.push(line.to_string());
        }
    }

    pub async fn container_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.containers.get(name).map(|c| c.id.clone())
    }

    pub async fn filesystem(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state.containers.get(name).map(|c| c.filesystem.clone())
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let state = self.state.lock().await;
        state.containers.get(name).is_some_and(|c| c.running)
    }

    pub async fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn image_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.images.keys().cloned().collect();
        names.sort();
        names
    }
}

fn chunked_stream(data: Vec<u8>, delay: Option<Duration>) -> ByteStream {
    let chunks: Vec<Bytes> = data
        .chunks(EXPORT_CHUNK)
        .map(Bytes::copy_from_slice)
        .collect();

    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<Bytes, io::Error>(chunk)
    });

    Box::new(StreamReader::new(Box::pin(stream)))
}

async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>, RuntimeError> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| RuntimeError::Api(format!("reading upload: {}", e)))?;
    Ok(buf)
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn inspect(&self, container: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let state = self.state.lock().await;
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;

        Ok(c.snapshot.clone())
    }

    async fn export_filesystem(&self, container: &str) -> Result<ByteStream, RuntimeError> {
        let state = self.state.lock().await;
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        Ok(chunked_stream(c.filesystem.clone(), state.export_chunk_delay))
    }

    async fn commit_image(
        &self,
        container: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().await;
        let layers = state
            .containers
            .get(container)
            .map(|c| c.filesystem.clone())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;

        let image = format!("{}:{}", repo, tag);
        state.images.insert(image.clone(), layers);
        Ok(image)
    }

    async fn save_image(&self, image: &str) -> Result<ByteStream, RuntimeError> {
        let state = self.state.lock().await;
        let layers = state
            .images
            .get(image)
            .ok_or_else(|| RuntimeError::NotFound(image.to_string()))?;

        let mut tarball = format!("{}\n{}\n", IMAGE_HEADER, image).into_bytes();
        tarball.extend_from_slice(layers);
        Ok(chunked_stream(tarball, None))
    }

    async fn load_image(&self, tarball: ByteStream) -> Result<(), RuntimeError> {
        let data = read_all(tarball).await?;

        let mut parts = data.splitn(3, |b| *b == b'\n');
        let header = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        let layers = parts.next().unwrap_or_default();
        if header != IMAGE_HEADER.as_bytes() || name.is_empty() {
            return Err(RuntimeError::Api("not an image tarball".into()));
        }

        let name = String::from_utf8_lossy(name).into_owned();
        self.state.lock().await.images.insert(name, layers.to_vec());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().await.images.contains_key(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.state
            .lock()
            .await
            .images
            .remove(image)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(image.to_string()))
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<ByteStream, RuntimeError> {
        let state = self.state.lock().await;
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;

        let skip = c.logs.len().saturating_sub(tail);
        let mut out = String::new();
        for line in &c.logs[skip..] {
            out.push_str(line);
            out.push('\n');
        }
        Ok(chunked_stream(out.into_bytes(), None))
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        snapshot: &ContainerSnapshot,
    ) -> Result<ContainerHandle, RuntimeError> {
        let delay = self.state.lock().await.create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.containers.contains_key(name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                name
            )));
        }
        if !state.images.contains_key(image) {
            return Err(RuntimeError::NotFound(image.to_string()));
        }

        let id = state.next_id();
        let mut created = snapshot.clone();
        created.container_ref = name.to_string();
        created.image = image.to_string();
        created.state = "created".to_string();

        state.containers.insert(
            name.to_string(),
            SimContainer {
                id: id.clone(),
                snapshot: created,
                filesystem: Vec::new(),
                logs: Vec::new(),
                running: false,
            },
        );

        Ok(ContainerHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn put_archive(
        &self,
        container: &str,
        tarball: ByteStream,
        _path: &str,
    ) -> Result<bool, RuntimeError> {
        let data = read_all(tarball).await?;

        let mut state = self.state.lock().await;
        let fail = state.fail_injection;
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        if fail {
            return Ok(false);
        }
        c.filesystem = data;
        Ok(true)
    }

    async fn name_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().await.containers.contains_key(name))
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        if state.fail_start {
            return Err(RuntimeError::Api(format!(
                "simulated start failure for {}",
                container
            )));
        }
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        c.running = true;
        c.snapshot.state = "running".to_string();
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> Result<(), RuntimeError> {
        self.state
            .lock()
            .await
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }
}
