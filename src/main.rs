use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::{json, Value};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldsync::network::HttpRemoteClient;
use fieldsync::storage::{OperationType, SledStore, Storage, UploadKind};
use fieldsync::sync::{Delivery, NewUpload, UploadOutcome};
use fieldsync::{Config, SyncEngine};

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    if let Ok(path) = std::env::var("FIELDSYNC_LOG_FILE") {
        // Library `log` records go to the rotating file; tracing events
        // stay on stderr.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        let max_size_mb = std::env::var("FIELDSYNC_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10);
        let max_files = std::env::var("FIELDSYNC_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3);

        if let Ok(rot) = RotatingFile::new(path, max_size_mb * 1024 * 1024, max_files) {
            builder.target(env_logger::Target::Pipe(Box::new(rot)));
        }
        let _ = builder.try_init();
    } else {
        // Only one `log` backend can be installed.
        let _ = LogTracer::init();
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    /// path -> path.1 -> ... -> path.N; the oldest file is overwritten.
    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let _ = std::fs::rename(
                format!("{}.{}", self.path, i),
                format!("{}.{}", self.path, i + 1),
            );
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first sync for field sample records and data files")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine until interrupted
    Run,

    /// Print connectivity, sync and queue counts
    Status,

    /// Push a mutation, or queue it when the remote is unreachable
    Enqueue {
        /// create, update, delete or upsert
        #[arg(short, long)]
        op: OperationType,

        /// Remote collection name
        #[arg(short, long)]
        table: String,

        /// JSON payload; must carry an "id"
        #[arg(long)]
        data: String,
    },

    /// Queue a local file for upload
    QueueUpload {
        /// raw or processed
        #[arg(short, long, default_value = "raw")]
        kind: UploadKind,

        #[arg(long)]
        sample_id: String,

        #[arg(long)]
        config_id: String,

        /// Target path inside the bucket
        #[arg(long)]
        remote_path: String,

        /// Local file to read
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Upload every pending file now
    Upload,

    /// Move uploads in error state back to pending
    RetryUploads,

    /// List operations that used up their retries and uploads in error state
    Failed,
}

fn build_engine(config: Config) -> anyhow::Result<SyncEngine> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create data directory '{}'", config.data_dir))?;

    let storage: Arc<dyn Storage> = Arc::new(
        SledStore::open(&config.data_dir)
            .with_context(|| format!("cannot open store in '{}'", config.data_dir))?,
    );
    let http = Arc::new(
        HttpRemoteClient::new(&config.remote)
            .with_context(|| format!("invalid remote settings for '{}'", config.remote.base_url))?,
    );

    Ok(SyncEngine::new(
        config,
        storage,
        http.clone(),
        http.clone(),
        http,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("cannot load config")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let engine = build_engine(config)?;

    match cli.command {
        Command::Run => {
            info!("Starting fieldsync against {}", engine.config().remote.base_url);
            let handle = engine.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            drop(handle);
        }
        Command::Status => {
            let reachable = engine.monitor().check_now().await;
            let status = json!({
                "reachable": reachable,
                "network": engine.monitor().network_state(),
                "queue": engine.queue_stats().await?,
                "sync": engine.stats().await,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Enqueue { op, table, data } => {
            let data: Value = serde_json::from_str(&data).context("payload is not valid JSON")?;
            engine.monitor().init().await;
            match engine.mutate(op, &table, data).await? {
                Delivery::Pushed => println!("pushed {op} on '{table}'"),
                Delivery::Queued(id) => println!("queued {op} on '{table}' as operation {id}"),
            }
        }
        Command::QueueUpload {
            kind,
            sample_id,
            config_id,
            remote_path,
            file,
        } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("cannot read '{}'", file.display()))?;
            let item = engine
                .queue_upload(NewUpload {
                    kind,
                    sample_id,
                    config_id,
                    file_path: remote_path,
                    payload,
                })
                .await?;
            println!("queued upload {} ({})", item.id, item.file_path);
        }
        Command::Upload => {
            let outcome = engine
                .start_upload_process(|progress| {
                    println!("[{:>3.0}%] {}", progress.percent, progress.status);
                })
                .await;
            match outcome {
                UploadOutcome::Finished(report) => {
                    println!("{} uploaded, {} failed", report.uploaded, report.failed)
                }
                UploadOutcome::StorageFault(_) => {
                    error!("Upload pass aborted by a storage error");
                    bail!("upload pass aborted");
                }
                other => println!("{other:?}"),
            }
        }
        Command::RetryUploads => {
            let count = engine.retry_failed_uploads().await?;
            println!("{count} uploads moved back to pending");
        }
        Command::Failed => {
            for op in engine.failed_operations().await? {
                println!(
                    "operation {} {} on '{}' after {} attempts: {}",
                    op.id, op.op_type, op.table, op.retry_count, op.data
                );
            }
            let stats = engine.queue_stats().await?;
            println!("{} uploads in error state", stats.error);
        }
    }

    engine.flush().await?;
    Ok(())
}
