//! Newline-framed JSON over TCP.
//!
//! One task per connection. Requests on a connection are answered in
//! order, so a `backups.create` that waits only holds up its own client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response, RpcError};

/// Longest accepted request line.
const MAX_LINE: u64 = 1024 * 1024;

pub async fn accept_loop(
    listener: TcpListener,
    handler: Arc<MethodHandler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "RPC server listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("RPC server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer, "Client connected");
        // Connections outlive the listener so in-flight calls can report
        // their cancellation.
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, peer, &handler).await {
                debug!(peer = %peer, error = %e, "Connection error");
            }
            debug!(peer = %peer, "Client disconnected");
        });
    }
}

/// Reply for one request line; `None` for notifications.
async fn dispatch(line: &str, peer: SocketAddr, handler: &MethodHandler) -> Option<Response> {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Unparseable request");
            return Some(Response::failed(serde_json::Value::Null, RpcError::parse(e)));
        }
    };

    let id = request.id.clone().unwrap_or_default();
    if let Err(e) = request.check() {
        warn!(peer = %peer, error = %e.message, "Invalid request");
        return Some(Response::failed(id, e));
    }

    let method = request.method.clone();
    let notification = request.is_notification();
    let started = Instant::now();
    let response = handler.handle(request).await;
    debug!(
        peer = %peer,
        method = %method,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = response.error.is_none(),
        "Handled request"
    );
    (!notification).then_some(response)
}

async fn serve(stream: TcpStream, peer: SocketAddr, handler: &MethodHandler) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut reader).take(MAX_LINE).read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 >= MAX_LINE {
            warn!(peer = %peer, "Request exceeds size limit, closing connection");
            let error = RpcError::new(super::protocol::INVALID_REQUEST, "request too large");
            send(&mut writer, &Response::failed(serde_json::Value::Null, error)).await?;
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(response) = dispatch(trimmed, peer, handler).await {
            send(&mut writer, &response).await?;
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> anyhow::Result<()> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    Ok(())
}
