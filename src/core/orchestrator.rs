use std::future::Future;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::Scheduler;
use crate::rpc::RpcServer;

/// Daemon lifecycle: storage probe, scheduler, RPC server, shutdown.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run until Ctrl-C.
    pub async fn start(&self) -> Result<()> {
        self.run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
        })
        .await
    }

    /// Run until `stop` completes, then cancel in-flight operations and give
    /// them `shutdown_grace_secs` to wind down.
    pub async fn run(&self, stop: impl Future<Output = ()>) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            jobs = self.ctx.jobs.len(),
            storage = self.ctx.storage.iter().count(),
            "cbkd starting"
        );
        self.probe_storage().await;

        let shutdown = CancellationToken::new();
        let server = RpcServer::bind(self.ctx.clone(), self.ctx.config.rpc_bind).await?;
        let scheduler = Scheduler::new(self.ctx.jobs.to_vec(), self.ctx.runner.clone());
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

        let served = tokio::select! {
            result = server.serve(shutdown.clone()) => result.context("RPC server failed"),
            () = stop => Ok(()),
        };

        shutdown.cancel();
        self.ctx.tracker.cancel_all();

        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        let grace = self.ctx.config.shutdown_grace();
        let active = self.ctx.tracker.active_count().await;
        if active > 0 {
            info!(operations = active, grace_secs = grace.as_secs(), "Waiting for cancelled operations");
        }
        if !self.ctx.tracker.wait_idle(grace).await {
            let remaining = self.ctx.tracker.active_count().await;
            warn!(operations = remaining, "In-flight operations did not finish before shutdown");
        }
        info!("cbkd stopped");
        served
    }

    async fn probe_storage(&self) {
        for (id, backend) in self.ctx.storage.iter() {
            match backend.test_connection().await {
                Ok(()) => {
                    let free = backend.available_space().await.ok().flatten();
                    info!(storage = %id, kind = backend.kind(), free_bytes = ?free, "Storage reachable");
                }
                Err(e) => warn!(storage = %id, kind = backend.kind(), error = %e, "Storage not reachable"),
            }
        }
    }
}
