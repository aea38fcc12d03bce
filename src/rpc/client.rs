//! CLI side of the RPC wire.
//!
//! Each call opens a connection, writes one request line and reads lines
//! until the reply carrying the same id arrives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

use super::api::{
    CancelReply, CreateBackupParams, CreateBackupReply, DaemonStatus, IdParams,
    ListBackupsParams, Method, PreviewParams, RunJobParams, RunJobReply, StartRestoreParams,
    StartRestoreReply, StorageView, VerifyReply,
};
use super::protocol::{Request, Response, RpcError};
use crate::core::{BackupRecord, OperationStatus, RestorePreview};
use crate::error::ErrorKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to daemon failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("daemon closed the connection before replying")]
    Closed,
    #[error("{0}")]
    Rpc(RpcError),
}

impl ClientError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Rpc(e) => e.kind(),
            _ => None,
        }
    }
}

pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let connect_error = |source: std::io::Error| ClientError::Connect {
            addr: self.addr,
            source,
        };
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| connect_error(std::io::ErrorKind::TimedOut.into()))?
            .map_err(connect_error)
    }

    /// Invoke `method` and decode its result.
    pub async fn call<P, T>(&self, method: Method, params: Option<&P>) -> Result<T, ClientError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&Request::new(method.name(), params, id))?;
        line.push(b'\n');

        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(&line).await?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(reply) = lines.next_line().await? {
            let response: Response = serde_json::from_str(&reply)?;
            if response.id != Value::from(id) && !response.id.is_null() {
                continue;
            }
            let result = response.into_result().map_err(ClientError::Rpc)?;
            return Ok(serde_json::from_value(result)?);
        }
        Err(ClientError::Closed)
    }

    async fn call_bare<T: DeserializeOwned>(&self, method: Method) -> Result<T, ClientError> {
        self.call(method, None::<&()>).await
    }

    pub async fn status(&self) -> Result<DaemonStatus, ClientError> {
        self.call_bare(Method::DaemonStatus).await
    }

    pub async fn create_backup(
        &self,
        params: &CreateBackupParams,
    ) -> Result<CreateBackupReply, ClientError> {
        self.call(Method::BackupsCreate, Some(params)).await
    }

    pub async fn list_backups(
        &self,
        params: &ListBackupsParams,
    ) -> Result<Vec<BackupRecord>, ClientError> {
        self.call(Method::BackupsList, Some(params)).await
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<BackupRecord, ClientError> {
        self.call(Method::BackupsGet, Some(&IdParams { id })).await
    }

    pub async fn verify_backup(&self, id: Uuid) -> Result<VerifyReply, ClientError> {
        self.call(Method::BackupsVerify, Some(&IdParams { id })).await
    }

    pub async fn expire_backup(&self, id: Uuid) -> Result<BackupRecord, ClientError> {
        self.call(Method::BackupsExpire, Some(&IdParams { id })).await
    }

    pub async fn start_restore(
        &self,
        params: &StartRestoreParams,
    ) -> Result<StartRestoreReply, ClientError> {
        self.call(Method::RestoreStart, Some(params)).await
    }

    pub async fn preview_restore(&self, params: &PreviewParams) -> Result<RestorePreview, ClientError> {
        self.call(Method::RestorePreview, Some(params)).await
    }

    pub async fn operations(&self) -> Result<Vec<OperationStatus>, ClientError> {
        self.call_bare(Method::OperationsList).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<CancelReply, ClientError> {
        self.call(Method::OperationsCancel, Some(&IdParams { id })).await
    }

    /// Job views as JSON; schedules serialize as their expression.
    pub async fn jobs(&self) -> Result<Value, ClientError> {
        self.call_bare(Method::JobsList).await
    }

    pub async fn run_job(&self, name: &str) -> Result<RunJobReply, ClientError> {
        let params = RunJobParams {
            name: name.to_string(),
        };
        self.call(Method::JobsRun, Some(&params)).await
    }

    pub async fn storage(&self) -> Result<Vec<StorageView>, ClientError> {
        self.call_bare(Method::StorageList).await
    }
}
