//! RPC method dispatch over a simulated daemon context.

use std::sync::Arc;

use cbkd::adapters::{SimulatedRuntime, demo_snapshot};
use cbkd::config::AppConfig;
use cbkd::context::AppContext;
use cbkd::core::{BackupRecord, ContainerRuntime, RestoreOutcome};
use cbkd::db;
use cbkd::error::ErrorKind;
use cbkd::rpc::api::{CreateBackupParams, StartRestoreParams, VerifyReply};
use cbkd::rpc::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND};
use cbkd::rpc::{Method, MethodHandler, Request, Response, error_code};
use cbkd::storage::{LocalBackend, StorageRegistry};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

async fn handler() -> (MethodHandler, SimulatedRuntime, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = StorageRegistry::new();
    storage.insert(
        "disk",
        Arc::new(LocalBackend::new(dir.path().join("archives"))),
    );

    let runtime = SimulatedRuntime::new();
    runtime
        .add_container(demo_snapshot("web1", "nginx:1.27"), b"hello\n".repeat(500))
        .await;

    let config = AppConfig {
        staging_dir: dir.path().join("staging"),
        simulation: true,
        ..Default::default()
    };
    let ctx = AppContext::new(
        config,
        db::init_in_memory().await.unwrap(),
        storage,
        Arc::new(runtime.clone()),
    )
    .unwrap();

    (MethodHandler::new(ctx), runtime, dir)
}

async fn call(handler: &MethodHandler, method: Method, params: Value) -> Response {
    handler
        .handle(Request::new(method.name(), Some(params), 1))
        .await
}

fn result<T: DeserializeOwned>(response: Response) -> T {
    let value = response.into_result().unwrap_or_else(|e| panic!("{}", e));
    serde_json::from_value(value).unwrap()
}

fn error_of(response: Response) -> cbkd::rpc::RpcError {
    response.into_result().unwrap_err()
}

#[tokio::test]
async fn create_list_and_preview() {
    let (handler, _runtime, _dir) = handler().await;

    let record: Value = result(
        call(
            &handler,
            Method::BackupsCreate,
            json!({ "container": "web1", "kind": "filesystem_only" }),
        )
        .await,
    );
    assert_eq!(record["status"], "verified");
    assert_eq!(record["storage_backend_id"], "disk");
    let id = record["id"].as_str().unwrap().to_string();

    let listed: Vec<BackupRecord> = result(
        call(&handler, Method::BackupsList, json!({ "container_ref": "web1" })).await,
    );
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.to_string(), id);

    let verified: VerifyReply =
        result(call(&handler, Method::BackupsVerify, json!({ "id": id })).await);
    assert!(verified.matches);
    assert_eq!(verified.actual.checksum, verified.expected);

    let preview: Value = result(
        call(
            &handler,
            Method::RestorePreview,
            json!({ "backup_id": id, "new_name": "web1-copy" }),
        )
        .await,
    );
    assert_eq!(preview["target_name"], "web1-copy");
    assert_eq!(preview["name_conflict"], false);
    assert_eq!(preview["image_present"], true);

    let status: Value = result(call(&handler, Method::DaemonStatus, Value::Null).await);
    assert_eq!(status["backups"]["verified"], 1);
    assert_eq!(status["simulation"], true);
    assert_eq!(status["schedule_timezone"], "local");
}

#[tokio::test]
async fn restore_start_waits_for_outcome() {
    let (handler, runtime, _dir) = handler().await;

    let record: BackupRecord =
        result(call(&handler, Method::BackupsCreate, json!({ "container": "web1" })).await);
    let outcome: RestoreOutcome = result(
        call(
            &handler,
            Method::RestoreStart,
            json!({ "backup_id": record.id, "new_name": "web1-b", "start": true }),
        )
        .await,
    );
    assert_eq!(outcome.container.name, "web1-b");
    assert!(outcome.started);
    assert!(runtime.is_running("web1-b").await);
}

#[tokio::test]
async fn typed_params_carry_logs_flag_and_overrides() {
    let (handler, runtime, _dir) = handler().await;
    runtime.log_line("web1", "GET /healthz 200").await;

    let mut create = CreateBackupParams::new("web1");
    create.include_logs = false;
    let wire = serde_json::to_value(&create).unwrap();
    assert_eq!(wire["include_logs"], false);
    let record: BackupRecord = result(call(&handler, Method::BackupsCreate, wire).await);
    assert_eq!(record.status.as_str(), "verified");

    let mut restore = StartRestoreParams::new(record.id);
    restore.new_name = Some("web1-env".to_string());
    restore.overrides.env = vec!["TZ=Europe/Berlin".to_string(), "DEBUG=1".to_string()];
    restore
        .overrides
        .labels
        .insert("tier".to_string(), "canary".to_string());
    let wire = serde_json::to_value(&restore).unwrap();
    let outcome: RestoreOutcome = result(call(&handler, Method::RestoreStart, wire).await);
    assert_eq!(outcome.container.name, "web1-env");

    let created = runtime.inspect("web1-env").await.unwrap();
    assert_eq!(
        created.env,
        vec!["SERVICE_NAME=web1", "TZ=Europe/Berlin", "DEBUG=1"]
    );
    assert_eq!(created.labels["tier"], "canary");
    assert_eq!(created.labels["cbkd.demo"], "true");
    assert_eq!(created.networks, vec!["bridge"]);
}

#[tokio::test]
async fn engine_errors_carry_kind_codes() {
    let (handler, _runtime, _dir) = handler().await;

    let error = error_of(call(&handler, Method::BackupsGet, json!({ "id": Uuid::now_v7() })).await);
    assert_eq!(error.code, error_code(ErrorKind::NotFound));
    assert_eq!(error.kind(), Some(ErrorKind::NotFound));
    assert_eq!(error.data.unwrap()["kind"], "not_found");

    let record: BackupRecord =
        result(call(&handler, Method::BackupsCreate, json!({ "container": "web1" })).await);
    let error = error_of(
        call(&handler, Method::RestoreStart, json!({ "backup_id": record.id })).await,
    );
    assert_eq!(error.code, error_code(ErrorKind::NameConflict));
    assert_eq!(error.kind(), Some(ErrorKind::NameConflict));

    let error = error_of(call(&handler, Method::JobsRun, json!({ "name": "missing" })).await);
    assert_eq!(error.code, error_code(ErrorKind::NotFound));

    let error = error_of(
        call(&handler, Method::BackupsCreate, json!({ "container": "ghost" })).await,
    );
    assert_eq!(error.code, error_code(ErrorKind::NotFound));
}

#[tokio::test]
async fn bad_params_and_unknown_methods() {
    let (handler, _runtime, _dir) = handler().await;

    let error = error_of(call(&handler, Method::BackupsGet, json!({ "id": "not-a-uuid" })).await);
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.kind(), None);

    let error = error_of(call(&handler, Method::RestoreStart, json!({})).await);
    assert_eq!(error.code, INVALID_PARAMS);

    let response = handler
        .handle(Request::new("backups.purge", None, 2))
        .await;
    assert_eq!(response.id, json!(2));
    assert_eq!(error_of(response).code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn storage_and_operations_views() {
    let (handler, _runtime, _dir) = handler().await;

    let storage: Value = result(call(&handler, Method::StorageList, Value::Null).await);
    assert_eq!(storage[0]["id"], "disk");
    assert_eq!(storage[0]["kind"], "local");
    assert_eq!(storage[0]["default"], true);
    assert_eq!(storage[0]["reachable"], true);

    let ops: Vec<Value> = result(call(&handler, Method::OperationsList, Value::Null).await);
    assert!(ops.is_empty());

    let cancelled: Value = result(
        call(&handler, Method::OperationsCancel, json!({ "id": Uuid::now_v7() })).await,
    );
    assert_eq!(cancelled["cancelled"], false);

    let jobs: Vec<Value> = result(call(&handler, Method::JobsList, Value::Null).await);
    assert!(jobs.is_empty());
}
