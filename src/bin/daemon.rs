//! Filerelay daemon
//!
//! Watches the configured roots and ships changed files to the remote
//! endpoint. Run with: filerelay-daemon --root <dir> --endpoint <url>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use filerelay::queue::sweep::ReconciliationSweep;
use filerelay::queue::worker::WorkerPool;
use filerelay::queue::QueueManager;
use filerelay::storage::Storage;
use filerelay::transport::{HttpTransport, Transport};
use filerelay::watch::debounce::Debouncer;
use filerelay::watch::normalizer::Normalizer;
use filerelay::watch::{scan_existing, FileWatcher};
use filerelay::{PipelineConfig, RelayError, WatchFilter};

#[derive(Parser, Debug)]
#[command(name = "filerelay-daemon")]
#[command(about = "Watch a filesystem tree and ship changed files to an HTTP endpoint")]
#[command(version)]
struct Args {
    /// Directory root(s) to watch
    #[arg(long, env = "FILERELAY_ROOT", required = true, num_args = 1..)]
    root: Vec<PathBuf>,

    /// Remote endpoint base URL
    #[arg(long, env = "FILERELAY_ENDPOINT")]
    endpoint: String,

    /// State database path
    #[arg(
        long,
        env = "FILERELAY_DB_PATH",
        default_value = "~/.local/share/filerelay/records.db"
    )]
    db_path: String,

    /// Extensions to include (comma-separated, empty = all)
    #[arg(long, env = "FILERELAY_INCLUDE_EXT", default_value = "")]
    include_ext: String,

    /// Path prefixes to exclude (comma-separated)
    #[arg(long, env = "FILERELAY_EXCLUDE_PREFIX", default_value = "")]
    exclude_prefix: String,

    /// Maximum file size in bytes (0 = unlimited)
    #[arg(long, env = "FILERELAY_MAX_FILE_SIZE", default_value = "104857600")]
    max_file_size: u64,

    /// Quiet window before a change settles, in milliseconds
    #[arg(long, env = "FILERELAY_DEBOUNCE_MS", default_value = "2000")]
    debounce_ms: u64,

    /// Concurrent upload workers
    #[arg(long, env = "FILERELAY_CONCURRENCY", default_value = "4")]
    concurrency: usize,

    /// First retry delay in milliseconds (doubles per attempt)
    #[arg(long, env = "FILERELAY_BACKOFF_BASE_MS", default_value = "1000")]
    backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[arg(long, env = "FILERELAY_BACKOFF_MAX_MS", default_value = "300000")]
    backoff_max_ms: u64,

    /// Transient failures before a record goes terminal
    #[arg(long, env = "FILERELAY_MAX_ATTEMPTS", default_value = "5")]
    max_attempts: i64,

    /// Worker lease duration in seconds
    #[arg(long, env = "FILERELAY_LEASE_SECS", default_value = "120")]
    lease_secs: u64,

    /// Reconciliation sweep period in seconds
    #[arg(long, env = "FILERELAY_SWEEP_SECS", default_value = "30")]
    sweep_secs: u64,

    /// Per-call upload timeout in seconds
    #[arg(long, env = "FILERELAY_UPLOAD_TIMEOUT_SECS", default_value = "60")]
    upload_timeout_secs: u64,

    /// Skip the initial scan of existing files
    #[arg(long, env = "FILERELAY_NO_INITIAL_SCAN")]
    no_initial_scan: bool,
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().trim_start_matches('.').to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

fn validate_roots(roots: &[PathBuf]) -> filerelay::Result<Vec<PathBuf>> {
    let mut valid = Vec::with_capacity(roots.len());
    for root in roots {
        let canonical = root
            .canonicalize()
            .map_err(|e| RelayError::Config(format!("watch root {}: {}", root.display(), e)))?;
        if !canonical.is_dir() {
            return Err(RelayError::Config(format!(
                "watch root {} is not a directory",
                canonical.display()
            )));
        }
        valid.push(canonical);
    }
    Ok(valid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = filerelay::VERSION, "Starting filerelay daemon");

    let config = PipelineConfig {
        debounce_window: Duration::from_millis(args.debounce_ms),
        concurrency: args.concurrency,
        backoff_base: Duration::from_millis(args.backoff_base_ms),
        backoff_max: Duration::from_millis(args.backoff_max_ms),
        backoff_jitter: 0.2,
        max_attempts: args.max_attempts,
        lease_duration: Duration::from_secs(args.lease_secs),
        sweep_interval: Duration::from_secs(args.sweep_secs),
        upload_timeout: Duration::from_secs(args.upload_timeout_secs),
    };

    let roots = validate_roots(&args.root)?;
    let filter = WatchFilter {
        include_extensions: split_csv(&args.include_ext),
        exclude_prefixes: args
            .exclude_prefix
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect(),
        max_file_size: args.max_file_size,
    };

    // The store is the pipeline's memory; running without it would be
    // state-blind, so failure here is fatal.
    let db_path = shellexpand::tilde(&args.db_path).into_owned();
    let storage = Storage::open(&db_path)?;
    tracing::info!(db = %db_path, "Record store opened");

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        args.endpoint.clone(),
        config.upload_timeout,
    )?);
    match transport.health_check().await {
        Ok(true) => tracing::info!(endpoint = %args.endpoint, "Endpoint reachable"),
        Ok(false) => tracing::warn!(endpoint = %args.endpoint, "Endpoint not reachable yet"),
        Err(e) => tracing::warn!("Health check error: {}", e),
    }

    let manager = Arc::new(QueueManager::new(storage.clone(), config.clone()));

    let (settled_tx, settled_rx) = async_channel::bounded(1024);
    let debouncer = Debouncer::new(storage.clone(), config.debounce_window, settled_tx);

    let settle_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Ok(intent) = settled_rx.recv().await {
                if let Err(e) = manager.handle_settled(&intent) {
                    tracing::error!(path = %intent.path().display(), "Settle failed: {}", e);
                }
            }
        })
    };

    if !args.no_initial_scan {
        scan_existing(&roots, &Normalizer::new(filter.clone()), &debouncer)?;
    }

    let watcher = FileWatcher::start(&roots, Normalizer::new(filter), debouncer.clone())?;
    let pool = WorkerPool::start(manager.clone(), transport);
    let sweep = ReconciliationSweep::start(storage.clone(), manager.clone(), config.sweep_interval);

    tracing::info!(
        roots = roots.len(),
        concurrency = config.concurrency,
        "Pipeline running, ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down, letting in-flight uploads finish");
    watcher.stop();
    sweep.stop();
    pool.shutdown().await;
    settle_task.abort();
    storage.checkpoint().ok();

    Ok(())
}
