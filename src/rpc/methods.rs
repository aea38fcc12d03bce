//! RPC method handlers.
//!
//! `params` are decoded into the typed payloads in [`super::api`]; a decode
//! failure is `INVALID_PARAMS`. Engine failures carry their kind's code.

use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::api::{
    BackupAccepted, CancelReply, CreateBackupParams, DaemonStatus, IdParams, JobView,
    ListBackupsParams, Method, PreviewParams, RestoreAccepted, RunJobParams, RunJobReply,
    StartRestoreParams, StorageView, VerifyReply,
};
use super::protocol::{Request, Response, RpcError};
use crate::context::AppContext;
use crate::core::{BackupKind, BackupRequest, RestoreRequest};
use crate::db::records::{self, RecordFilter};
use crate::error::EngineError;

type Reply = Result<Value, RpcError>;

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn encode(value: impl serde::Serialize) -> Reply {
    serde_json::to_value(value).map_err(RpcError::internal)
}

fn engine(err: EngineError) -> RpcError {
    RpcError::from(&err)
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let reply = match request.method.parse::<Method>() {
            Ok(method) => self.invoke(method, params).await,
            Err(()) => Err(RpcError::unknown_method(&request.method)),
        };
        match reply {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::failed(id, error),
        }
    }

    async fn invoke(&self, method: Method, params: Value) -> Reply {
        match method {
            Method::DaemonStatus => self.daemon_status().await,
            Method::BackupsList => self.backups_list(decode(params)?).await,
            Method::BackupsGet => self.backups_get(decode(params)?).await,
            Method::BackupsCreate => self.backups_create(decode(params)?).await,
            Method::BackupsVerify => self.backups_verify(decode(params)?).await,
            Method::BackupsExpire => {
                let IdParams { id } = decode(params)?;
                encode(self.ctx.pruner.expire(id).await.map_err(engine)?)
            }
            Method::RestoreStart => self.restore_start(decode(params)?).await,
            Method::RestorePreview => {
                let PreviewParams { backup_id, new_name } = decode(params)?;
                let preview = self
                    .ctx
                    .restores
                    .preview(backup_id, new_name.as_deref())
                    .await
                    .map_err(engine)?;
                encode(preview)
            }
            Method::OperationsList => encode(self.ctx.tracker.get_all().await),
            Method::OperationsGet => {
                let IdParams { id } = decode(params)?;
                let status = self
                    .ctx
                    .tracker
                    .get(id)
                    .await
                    .ok_or_else(|| engine(EngineError::not_found("operation", id.to_string())))?;
                encode(status)
            }
            Method::OperationsCancel => {
                let IdParams { id } = decode(params)?;
                let cancelled = self.ctx.tracker.cancel(id).await;
                if cancelled {
                    info!(operation_id = %id, "Cancellation requested");
                }
                encode(CancelReply { cancelled })
            }
            Method::JobsList => self.jobs_list(),
            Method::JobsRun => self.jobs_run(decode(params)?),
            Method::StorageList => self.storage_list().await,
        }
    }

    async fn daemon_status(&self) -> Reply {
        let backups = records::count_by_status(&self.ctx.db)
            .await
            .map_err(|e| RpcError::internal(format!("{:#}", e)))?;

        encode(DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_operations: self.ctx.tracker.active_count().await,
            jobs: self.ctx.jobs.len(),
            storage: self.ctx.storage.iter().map(|(id, _)| id.clone()).collect(),
            backups,
            rpc_bind: self.ctx.config.rpc_bind.to_string(),
            simulation: self.ctx.config.simulation,
            schedule_timezone: self.ctx.config.schedule_timezone.clone(),
        })
    }

    async fn backups_list(&self, params: ListBackupsParams) -> Reply {
        let filter = RecordFilter {
            container_ref: params.container_ref,
            status: params.status,
            limit: params.limit,
        };
        let list = records::list(&self.ctx.db, filter)
            .await
            .map_err(|e| RpcError::internal(format!("{:#}", e)))?;
        encode(list)
    }

    async fn backups_get(&self, IdParams { id }: IdParams) -> Reply {
        let record = records::get(&self.ctx.db, id)
            .await
            .map_err(|e| RpcError::internal(format!("{:#}", e)))?
            .ok_or_else(|| engine(EngineError::not_found("backup", id.to_string())))?;
        encode(record)
    }

    async fn backups_create(&self, params: CreateBackupParams) -> Reply {
        let storage = params
            .storage
            .or_else(|| self.default_storage())
            .ok_or_else(|| {
                RpcError::invalid_params("no storage given and no default_storage configured")
            })?;

        let req = BackupRequest {
            backup_id: params.backup_id.unwrap_or_else(Uuid::now_v7),
            container_ref: params.container,
            kind: params.kind.unwrap_or(BackupKind::Full),
            compression_level: params
                .compression_level
                .unwrap_or(self.ctx.config.default_compression_level),
            storage_backend_id: storage,
            verify: params.verify.unwrap_or(self.ctx.config.verify_backups),
            include_logs: params.include_logs,
        };
        let backup_id = req.backup_id;

        if params.wait {
            let record = self.ctx.backups.create_backup(req).await.map_err(engine)?;
            return encode(record);
        }

        let backups = self.ctx.backups.clone();
        tokio::spawn(async move {
            if let Err(e) = backups.create_backup(req).await {
                warn!(backup_id = %backup_id, error = %e, "Background backup failed");
            }
        });
        encode(BackupAccepted { backup_id })
    }

    async fn backups_verify(&self, IdParams { id }: IdParams) -> Reply {
        let result = self.ctx.backups.verify_existing(id).await.map_err(engine)?;
        encode(VerifyReply {
            id,
            matches: result.matches(),
            expected: result.expected,
            actual: result.actual,
        })
    }

    async fn restore_start(&self, params: StartRestoreParams) -> Reply {
        let req = RestoreRequest {
            operation_id: params.operation_id.unwrap_or_else(Uuid::now_v7),
            backup_id: params.backup_id,
            new_name: params.new_name,
            start_after: params.start,
            overrides: params.overrides,
        };
        let operation_id = req.operation_id;

        if params.wait {
            let outcome = self.ctx.restores.restore(req).await.map_err(engine)?;
            return encode(outcome);
        }

        let restores = self.ctx.restores.clone();
        tokio::spawn(async move {
            if let Err(e) = restores.restore(req).await {
                warn!(operation_id = %operation_id, error = %e, "Background restore failed");
            }
        });
        encode(RestoreAccepted { operation_id })
    }

    fn jobs_list(&self) -> Reply {
        let now = Utc::now();
        let views: Vec<JobView<'_>> = self
            .ctx
            .jobs
            .iter()
            .map(|job| JobView {
                job,
                next_run: job
                    .enabled
                    .then(|| job.schedule.next_after(now))
                    .flatten(),
                running: self.ctx.runner.is_running(&job.name),
            })
            .collect();
        encode(views)
    }

    fn jobs_run(&self, RunJobParams { name }: RunJobParams) -> Reply {
        let job = self
            .ctx
            .job(&name)
            .ok_or_else(|| engine(EngineError::not_found("job", name.clone())))?;
        let dispatched = self.ctx.runner.try_dispatch(job.clone());
        info!(job = %name, dispatched, "Manual job run requested");
        encode(RunJobReply { dispatched })
    }

    async fn storage_list(&self) -> Reply {
        let default = self.default_storage();
        let mut views = Vec::new();
        for (storage_id, backend) in self.ctx.storage.iter() {
            let (reachable, error) = match backend.test_connection().await {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            let free_bytes = if reachable {
                backend.available_space().await.ok().flatten()
            } else {
                None
            };
            views.push(StorageView {
                id: storage_id.clone(),
                kind: backend.kind().to_string(),
                reachable,
                error,
                free_bytes,
                default: default.as_deref() == Some(storage_id.as_str()),
            });
        }
        encode(views)
    }

    /// Configured default, or the only backend when there is exactly one.
    fn default_storage(&self) -> Option<String> {
        if let Some(default) = &self.ctx.config.default_storage {
            return Some(default.clone());
        }
        let mut ids = self.ctx.storage.iter().map(|(id, _)| id.clone());
        match (ids.next(), ids.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}
