//! Docker Engine runtime via `bollard`.
//!
//! Exports and log tails stream straight through; a stream that yields
//! nothing for `idle_timeout` fails with `TimedOut`. Uploads (`load_image`,
//! `put_archive`) are read under the same idle limit and handed to the
//! engine as one body, since bollard 0.16 only accepts `Bytes` uploads.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CommitContainerOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::network::ConnectNetworkOptions;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::core::models::{ContainerHandle, ContainerSnapshot, MountSpec, PortSpec};
use crate::core::runtime::{ContainerRuntime, RuntimeError};
use crate::storage::ByteStream;

const STREAM_BUFFER: usize = 16;
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    /// Longest gap allowed between two chunks of a stream
    idle_timeout: Duration,
}

impl DockerRuntime {
    pub async fn connect(socket: Option<&str>, idle_timeout: Duration) -> Result<Self> {
        let docker = match socket {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker at {}", path))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon. Is Docker running?")?,
        };
        docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(Self {
            docker,
            idle_timeout,
        })
    }
}

fn classify(err: DockerError, subject: &str) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// Pump a bollard byte stream from a background task into a `ByteStream`.
/// Mid-stream errors surface to the reader rather than as a short read.
fn pump<F>(produce: F) -> ByteStream
where
    F: FnOnce(futures::channel::mpsc::Sender<io::Result<Bytes>>) -> futures::future::BoxFuture<'static, ()>,
{
    let (tx, rx) = futures::channel::mpsc::channel(STREAM_BUFFER);
    tokio::spawn(produce(tx));
    Box::new(StreamReader::new(rx))
}

/// Copy chunks into `tx` until the stream ends, fails, stalls for `idle`,
/// or the reader goes away.
async fn forward(
    mut stream: BoxStream<'static, Result<Bytes, DockerError>>,
    subject: String,
    idle: Duration,
    mut tx: futures::channel::mpsc::Sender<io::Result<Bytes>>,
) {
    loop {
        let item = match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(chunk)) => chunk.map_err(|e| io::Error::other(classify(e, &subject))),
            Ok(None) => return,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} sent nothing for {:?}", subject, idle),
            )),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

fn export_stream(docker: Docker, name: String, image: bool, idle: Duration) -> ByteStream {
    pump(move |tx| {
        Box::pin(async move {
            let stream = if image {
                docker.export_image(&name).boxed()
            } else {
                docker.export_container(&name).boxed()
            };
            forward(stream, name, idle, tx).await;
        })
    })
}

async fn read_all(mut data: ByteStream, idle: Duration) -> Result<Vec<u8>, RuntimeError> {
    let mut body = Vec::new();
    let mut chunk = vec![0u8; UPLOAD_CHUNK];
    loop {
        let n = tokio::time::timeout(idle, data.read(&mut chunk))
            .await
            .map_err(|_| RuntimeError::Timeout("reading upload body".to_string()))?
            .map_err(|e| RuntimeError::Api(format!("reading upload body: {}", e)))?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

fn snapshot_from(name: &str, info: bollard::models::ContainerInspectResponse) -> ContainerSnapshot {
    let config = info.config.unwrap_or_default();

    let mut mounts: Vec<MountSpec> = info
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| {
            let kind = m.typ.map(|t| t.to_string()).unwrap_or_else(|| "bind".into());
            let source = if kind == "volume" { m.name } else { m.source };
            Some(MountSpec {
                kind,
                source: source.unwrap_or_default(),
                destination: m.destination?,
                read_only: !m.rw.unwrap_or(true),
            })
        })
        .collect();
    mounts.sort_by(|a, b| a.destination.cmp(&b.destination));

    let settings = info.network_settings.unwrap_or_default();
    let mut ports = Vec::new();
    for (container_port, bindings) in settings.ports.unwrap_or_default() {
        match bindings {
            Some(bindings) if !bindings.is_empty() => {
                for b in bindings {
                    ports.push(PortSpec {
                        container_port: container_port.clone(),
                        host_ip: b.host_ip.filter(|ip| !ip.is_empty()),
                        host_port: b.host_port.filter(|p| !p.is_empty()),
                    });
                }
            }
            _ => ports.push(PortSpec {
                container_port,
                host_ip: None,
                host_port: None,
            }),
        }
    }
    ports.sort_by(|a, b| {
        (&a.container_port, &a.host_ip, &a.host_port).cmp(&(&b.container_port, &b.host_ip, &b.host_port))
    });

    let mut networks: Vec<String> = settings
        .networks
        .map(|n| n.into_keys().collect())
        .unwrap_or_default();
    networks.sort();

    ContainerSnapshot {
        container_ref: info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        image: config.image.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        mounts,
        ports,
        networks,
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        command: config.cmd.unwrap_or_default(),
        state: info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into()),
    }
}

fn create_config(image: &str, snapshot: &ContainerSnapshot) -> Config<String> {
    let mounts = snapshot
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.destination.clone()),
            source: Some(m.source.clone()).filter(|s| !s.is_empty()),
            typ: Some(match m.kind.as_str() {
                "volume" => MountTypeEnum::VOLUME,
                "tmpfs" => MountTypeEnum::TMPFS,
                _ => MountTypeEnum::BIND,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for p in &snapshot.ports {
        exposed_ports.insert(p.container_port.clone(), HashMap::new());
        let entry = port_bindings.entry(p.container_port.clone()).or_insert(None);
        if p.host_port.is_some() || p.host_ip.is_some() {
            entry.get_or_insert_with(Vec::new).push(PortBinding {
                host_ip: p.host_ip.clone(),
                host_port: p.host_port.clone(),
            });
        }
    }

    Config {
        image: Some(image.to_string()),
        env: Some(snapshot.env.clone()),
        cmd: (!snapshot.command.is_empty()).then(|| snapshot.command.clone()),
        labels: Some(snapshot.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            network_mode: snapshot.networks.first().cloned(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, container: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let info = self
            .docker
            .inspect_container(container, None)
            .await
            .map_err(|e| classify(e, container))?;
        Ok(snapshot_from(container, info))
    }

    async fn export_filesystem(&self, container: &str) -> Result<ByteStream, RuntimeError> {
        Ok(export_stream(
            self.docker.clone(),
            container.to_string(),
            false,
            self.idle_timeout,
        ))
    }

    async fn commit_image(
        &self,
        container: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, RuntimeError> {
        let options = CommitContainerOptions {
            container: container.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| classify(e, container))?;

        let image = format!("{}:{}", repo, tag);
        debug!(container = %container, image = %image, "Committed container");
        Ok(image)
    }

    async fn save_image(&self, image: &str) -> Result<ByteStream, RuntimeError> {
        Ok(export_stream(
            self.docker.clone(),
            image.to_string(),
            true,
            self.idle_timeout,
        ))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        let deleted = self
            .docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(|e| classify(e, image))?;
        debug!(image = %image, layers = deleted.len(), "Removed image");
        Ok(())
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<ByteStream, RuntimeError> {
        if !self.name_exists(container).await? {
            return Err(RuntimeError::NotFound(container.to_string()));
        }
        let docker = self.docker.clone();
        let name = container.to_string();
        let idle = self.idle_timeout;
        Ok(pump(move |tx| {
            Box::pin(async move {
                let options = LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    timestamps: true,
                    tail: tail.to_string(),
                    ..Default::default()
                };
                let stream = docker
                    .logs(&name, Some(options))
                    .map(|line| line.map(LogOutput::into_bytes))
                    .boxed();
                forward(stream, name, idle, tx).await;
            })
        }))
    }

    async fn load_image(&self, tarball: ByteStream) -> Result<(), RuntimeError> {
        let body = read_all(tarball, self.idle_timeout).await?;
        let mut progress = Box::pin(self.docker.import_image(
            ImportImageOptions { quiet: true },
            body.into(),
            None,
        ));
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| RuntimeError::Api(e.to_string()))?;
            if let Some(err) = info.error {
                return Err(RuntimeError::Api(err));
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, image) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        snapshot: &ContainerSnapshot,
    ) -> Result<ContainerHandle, RuntimeError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), create_config(image, snapshot))
            .await
            .map_err(|e| classify(e, image))?;

        for warning in &created.warnings {
            warn!(container = %name, warning = %warning, "Docker create warning");
        }

        for network in snapshot.networks.iter().skip(1) {
            let connect = ConnectNetworkOptions {
                container: name.to_string(),
                endpoint_config: EndpointSettings::default(),
            };
            self.docker
                .connect_network(network, connect)
                .await
                .map_err(|e| classify(e, network))?;
        }

        Ok(ContainerHandle {
            id: created.id,
            name: name.to_string(),
        })
    }

    async fn put_archive(
        &self,
        container: &str,
        tarball: ByteStream,
        path: &str,
    ) -> Result<bool, RuntimeError> {
        let body = read_all(tarball, self.idle_timeout).await?;
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        match self
            .docker
            .upload_to_container(container, Some(options), body.into())
            .await
        {
            Ok(()) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NotFound(container.to_string())),
            Err(DockerError::DockerResponseServerError {
                status_code,
                message,
            }) => {
                warn!(container = %container, status_code, message = %message, "Archive upload refused");
                Ok(false)
            }
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn name_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_container(name, None).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, name) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, container))
    }

    async fn remove_container(&self, container: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container, Some(options))
            .await
            .map_err(|e| classify(e, container))
    }
}
