//! JSON-RPC 2.0 control surface of the daemon.
//!
//! `api` holds the typed params and replies, `protocol` the envelopes and
//! error codes, `methods` the dispatcher, `transport` the TCP framing and
//! `client` the CLI's side of the wire.

pub mod api;
pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

pub use api::Method;
pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError, error_code, error_kind};

/// A bound listener plus the handler its connections dispatch to.
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl RpcServer {
    /// Bind now so address conflicts surface before the daemon reports ready.
    pub async fn bind(ctx: AppContext, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind RPC listener on {}", addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(MethodHandler::new(ctx)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        transport::accept_loop(self.listener, self.handler, shutdown).await
    }
}
