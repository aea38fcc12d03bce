use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::core::models::{ContainerSnapshot, MountSpec, PortSpec};
use crate::core::runtime::ContainerRuntime;

pub mod docker;
pub mod simulated;

pub use docker::DockerRuntime;
pub use simulated::SimulatedRuntime;

/// Runtime selected by configuration. In simulation mode a few demo
/// containers are registered and stdin accepts control commands.
pub async fn connect_runtime(config: &AppConfig) -> Result<Arc<dyn ContainerRuntime>> {
    if config.simulation {
        let runtime = SimulatedRuntime::new();
        seed_demo(&runtime).await;
        spawn_console(runtime.clone());
        info!("Using simulated container runtime");
        return Ok(Arc::new(runtime));
    }

    let runtime = DockerRuntime::connect(
        config.docker_socket.as_deref(),
        config.runtime_timeout(),
    )
    .await?;
    info!("Connected to Docker");
    Ok(Arc::new(runtime))
}

pub fn demo_snapshot(name: &str, image: &str) -> ContainerSnapshot {
    ContainerSnapshot {
        container_ref: name.to_string(),
        image: image.to_string(),
        env: vec![format!("SERVICE_NAME={}", name), "TZ=UTC".to_string()],
        mounts: vec![MountSpec {
            kind: "volume".to_string(),
            source: format!("{}-data", name),
            destination: "/data".to_string(),
            read_only: false,
        }],
        ports: vec![PortSpec {
            container_port: "80/tcp".to_string(),
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some("8080".to_string()),
        }],
        networks: vec!["bridge".to_string()],
        labels: BTreeMap::from([("cbkd.demo".to_string(), "true".to_string())]),
        command: vec![],
        state: "running".to_string(),
    }
}

async fn seed_demo(runtime: &SimulatedRuntime) {
    for (name, image) in [("web1", "nginx:1.27"), ("db", "postgres:16")] {
        let filesystem = format!("demo filesystem of {}\n", name).repeat(4096).into_bytes();
        runtime
            .add_container(demo_snapshot(name, image), filesystem)
            .await;
    }
}

fn spawn_console(controller: SimulatedRuntime) {
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines() {
            let Ok(cmd) = line else { break };
            let parts: Vec<&str> = cmd.split_whitespace().collect();
            let on = |arg: Option<&&str>| arg.is_some_and(|a| *a == "on");
            match parts.first().copied() {
                Some("add") => {
                    let name = parts.get(1).copied().unwrap_or("app");
                    let image = parts.get(2).copied().unwrap_or("alpine:3.20");
                    handle.block_on(controller.add_container(
                        demo_snapshot(name, image),
                        format!("filesystem of {}\n", name).into_bytes(),
                    ));
                }
                Some("rmi") => {
                    if let Some(image) = parts.get(1) {
                        if let Err(e) = handle.block_on(controller.remove_image(image)) {
                            println!("(Simulator) {}", e);
                        }
                    }
                }
                Some("inject-fail") => {
                    handle.block_on(controller.set_fail_injection(on(parts.get(1))))
                }
                Some("start-fail") => handle.block_on(controller.set_fail_start(on(parts.get(1)))),
                Some("slow") => {
                    let delay = parts
                        .get(1)
                        .and_then(|ms| ms.parse::<u64>().ok())
                        .filter(|ms| *ms > 0)
                        .map(Duration::from_millis);
                    handle.block_on(controller.set_export_delay(delay));
                }
                Some("log") if parts.len() > 2 => {
                    handle.block_on(controller.log_line(parts[1], &parts[2..].join(" ")));
                }
                Some("ls") => {
                    let names = handle.block_on(controller.container_names());
                    let images = handle.block_on(controller.image_names());
                    println!("(Simulator) containers: {}", names.join(", "));
                    println!("(Simulator) images: {}", images.join(", "));
                }
                _ => println!(
                    "(Simulator) Use: 'add <name> [image]', 'rmi <image>', \
                     'log <name> <text>', 'inject-fail on|off', 'start-fail on|off', \
                     'slow <ms>', 'ls'"
                ),
            }
        }
    });
}
