use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use cbkd::core::{
    BackupKind, BackupRecord, BackupStatus, ConfigOverrides, OperationStatus, Orchestrator,
};
use cbkd::logging::{self, LogConfig};
use cbkd::rpc::RpcClient;
use cbkd::rpc::api::{
    CreateBackupParams, CreateBackupReply, ListBackupsParams, PreviewParams, StartRestoreParams,
    StartRestoreReply,
};
use cbkd::{adapters, config, context, db, storage};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cbkd")]
#[command(about = "Container backup and restore daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./cbkd.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon RPC address, overriding the configured rpc_bind
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon(ServerArgs),
    /// Daemon health and catalog counts
    Status,
    /// Back up a container now
    Backup {
        container: String,
        #[arg(long, default_value = "full")]
        kind: BackupKind,
        #[arg(long)]
        storage: Option<String>,
        #[arg(long)]
        level: Option<u8>,
        #[arg(long)]
        no_verify: bool,
        /// Leave the container's log tail out of the archive
        #[arg(long)]
        no_logs: bool,
        /// Return once the backup has started
        #[arg(long)]
        detach: bool,
    },
    /// Restore a backup into a new container
    Restore {
        backup_id: Uuid,
        /// Target container name (defaults to the original name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        start: bool,
        /// Environment entry replacing the captured one with the same key
        #[arg(long, value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Label merged over the captured labels
        #[arg(long, value_name = "KEY=VALUE")]
        label: Vec<String>,
        /// Network to attach instead of the captured ones
        #[arg(long)]
        network: Vec<String>,
        #[arg(long)]
        detach: bool,
    },
    /// Show what a restore would do
    Preview {
        backup_id: Uuid,
        #[arg(long)]
        name: Option<String>,
    },
    /// List backup records, newest first
    List {
        #[arg(long)]
        container: Option<String>,
        #[arg(long)]
        status: Option<BackupStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show one backup record
    Show { id: Uuid },
    /// Re-hash a stored archive against its recorded checksum
    Verify { id: Uuid },
    /// Delete a backup's archive and mark it expired
    Expire { id: Uuid },
    /// Cancel an in-flight backup or restore
    Cancel { id: Uuid },
    /// In-flight operations
    Ops,
    /// Scheduled jobs
    Jobs {
        /// Run the named job now
        #[arg(long)]
        run: Option<String>,
    },
    /// Storage backends and their reachability
    Storage,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::load(cli.config.as_deref(), Some(args))?,
        _ => config::AppConfig::load(cli.config.as_deref(), None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Daemon failed")
        }
        command => {
            let client = RpcClient::new(cli.rpc.unwrap_or(config.rpc_bind));
            run_command(&client, command).await
        }
    }
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.staging_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.staging_dir.display()))?;
    let db = db::init(&config.database_path).await?;
    let registry = storage::StorageRegistry::from_config(
        &config.storage,
        &config.retry,
        config.staging_dir.clone(),
    )
    .await?;
    let runtime = adapters::connect_runtime(&config).await?;
    let ctx = context::AppContext::new(config, db, registry, runtime)?;
    Orchestrator::new(ctx).start().await
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_record_line(r: &BackupRecord) {
    println!(
        "{}  {:<20} {:<16} {:<9} {:>12}  {}",
        r.id,
        r.container_ref,
        r.kind.as_str(),
        r.status.as_str(),
        r.size_bytes,
        r.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn parse_label(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("label {:?} is not KEY=VALUE", entry),
    }
}

async fn run_command(client: &RpcClient, command: Commands) -> Result<()> {
    match command {
        Commands::Daemon(_) => bail!("daemon is not a client command"),
        Commands::Status => {
            let status = client
                .status()
                .await
                .context("Failed to check status of daemon")?;
            print_json(&status)?;
        }
        Commands::Backup {
            container,
            kind,
            storage,
            level,
            no_verify,
            no_logs,
            detach,
        } => {
            let mut params = CreateBackupParams::new(&container);
            params.kind = Some(kind);
            params.storage = storage;
            params.compression_level = level;
            params.verify = no_verify.then_some(false);
            params.include_logs = !no_logs;
            params.wait = !detach;

            match client.create_backup(&params).await? {
                CreateBackupReply::Accepted(started) => {
                    println!("Backup started: {}", started.backup_id);
                }
                CreateBackupReply::Finished(record) => println!(
                    "Backup {} of {} complete: {} bytes, {}",
                    record.id,
                    record.container_ref,
                    record.size_bytes,
                    record.checksum.as_deref().unwrap_or("-")
                ),
            }
        }
        Commands::Restore {
            backup_id,
            name,
            start,
            env,
            label,
            network,
            detach,
        } => {
            let mut params = StartRestoreParams::new(backup_id);
            params.new_name = name;
            params.start = start;
            params.wait = !detach;
            params.overrides = ConfigOverrides {
                env,
                labels: label
                    .iter()
                    .map(|entry| parse_label(entry))
                    .collect::<Result<_>>()?,
                networks: (!network.is_empty()).then_some(network),
                ..Default::default()
            };

            match client.start_restore(&params).await? {
                StartRestoreReply::Accepted(started) => {
                    println!("Restore started: {}", started.operation_id);
                }
                StartRestoreReply::Finished(outcome) => {
                    println!(
                        "Restored {} into container {} ({})",
                        outcome.backup_id, outcome.container.name, outcome.container.id
                    );
                    if let Some(err) = outcome.start_error {
                        println!("Container did not start: {}", err);
                    }
                }
            }
        }
        Commands::Preview { backup_id, name } => {
            let preview = client
                .preview_restore(&PreviewParams {
                    backup_id,
                    new_name: name,
                })
                .await?;
            print_json(&preview)?;
        }
        Commands::List {
            container,
            status,
            limit,
        } => {
            let records = client
                .list_backups(&ListBackupsParams {
                    container_ref: container,
                    status,
                    limit: Some(limit),
                })
                .await?;
            if records.is_empty() {
                println!("No backups");
            }
            for record in &records {
                print_record_line(record);
            }
        }
        Commands::Show { id } => print_json(&client.get_backup(id).await?)?,
        Commands::Verify { id } => {
            let result = client.verify_backup(id).await?;
            if !result.matches {
                bail!(
                    "Backup {} checksum mismatch: expected {}, got {}",
                    id,
                    result.expected,
                    result.actual.checksum
                );
            }
            println!("Backup {} verified: {}", id, result.actual.checksum);
        }
        Commands::Expire { id } => {
            let record = client.expire_backup(id).await?;
            println!("Backup {} is {}", record.id, record.status);
        }
        Commands::Cancel { id } => {
            if client.cancel(id).await?.cancelled {
                println!("Cancellation requested for {}", id);
            } else {
                println!("No running operation {}", id);
            }
        }
        Commands::Ops => {
            let ops: Vec<OperationStatus> = client.operations().await?;
            if ops.is_empty() {
                println!("No operations in flight");
            }
            for op in ops {
                println!(
                    "{}  {:?} {:<20} {:<14} {:>12} bytes{}",
                    op.id,
                    op.kind,
                    op.subject,
                    op.phase,
                    op.bytes_processed,
                    if op.cancel_requested { "  (cancelling)" } else { "" }
                );
            }
        }
        Commands::Jobs { run: Some(name) } => {
            if client.run_job(&name).await?.dispatched {
                println!("Job {} dispatched", name);
            } else {
                println!("Job {} is already running", name);
            }
        }
        Commands::Jobs { run: None } => print_json(&client.jobs().await?)?,
        Commands::Storage => print_json(&client.storage().await?)?,
    }

    Ok(())
}
