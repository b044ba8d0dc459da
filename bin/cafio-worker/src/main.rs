//! CAFIO Worker
//!
//! Runs the packing pipeline and the retrieval façade side by side:
//! the pipeline drains the upload queue into CAF containers and ships them,
//! the façade serves member slices back out over HTTP.
//!
//! Exits 0 on graceful shutdown, 1 on initialization failure (catalog
//! unreachable, worker row missing, blob home unavailable).

use anyhow::{bail, Context, Result};
use cafio_adapters::{Catalog, DirQueue, FsBlobService, FsObjectStore, RedbCatalog};
use cafio_common::{ChainMode, WorkerConfig};
use cafio_facade::FacadeConfig;
use cafio_pipeline::{PackingPipeline, PipelineConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cafio-worker")]
#[command(about = "CAF batch-packing worker and retrieval facade")]
#[command(version)]
struct Args {
    /// Worker identity; selects the catalog worker row and the HTTP port
    #[arg(long, default_value = "1")]
    worker_id: u16,

    /// Remote blob deployment to ship containers to
    #[arg(long, value_enum, default_value = "testnet")]
    chain_mode: ChainModeArg,

    /// Maximum container size in GB (hard ceiling 32)
    #[arg(long, default_value = "30.0")]
    caf_max_size_gb: f64,

    /// Inactivity finalization threshold in minutes
    #[arg(long, default_value = "5")]
    caf_timeout_minutes: u64,

    /// Queue prefetch count (1 = strict single-message mode)
    #[arg(long, default_value = "1")]
    prefetch: u16,

    /// Directory for containers-in-flight and the retrieval cache
    #[arg(long, default_value = "/tmp/cafio")]
    temp_dir: PathBuf,

    /// Container download deadline in the façade, milliseconds
    #[arg(long, default_value = "300000")]
    download_timeout_ms: u64,

    /// Delete downloaded containers after serving instead of keeping them
    #[arg(long, default_value_t = false)]
    delete_caf_files: bool,

    /// Pending-message ceiling that finalizes a batch
    #[arg(long, default_value = "1000")]
    batch_ceiling: usize,

    /// Directory holding the source objects
    #[arg(long, default_value = "/var/lib/cafio/objects")]
    source_dir: PathBuf,

    /// Home directory of the blob store
    #[arg(long, default_value = "/var/lib/cafio/blobs")]
    blob_home: PathBuf,

    /// Path of the catalog database
    #[arg(long, default_value = "/var/lib/cafio/catalog.redb")]
    catalog_path: PathBuf,

    /// Spool directory the queue messages arrive in
    #[arg(long, default_value = "/var/lib/cafio/spool")]
    spool_dir: PathBuf,

    /// Create the worker identity row if it is missing
    #[arg(long, default_value_t = false)]
    register_worker: bool,

    /// Address recorded on a newly registered worker row
    #[arg(long, default_value = "")]
    worker_address: String,

    /// Seed recorded on a newly registered worker row
    #[arg(long, default_value = "")]
    worker_seed: String,

    /// CORS origin allow-list (repeatable)
    #[arg(long = "allow-origin", default_value = "http://localhost:3000")]
    allowed_origins: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ChainModeArg {
    Mainnet,
    Testnet,
}

impl From<ChainModeArg> for ChainMode {
    fn from(mode: ChainModeArg) -> Self {
        match mode {
            ChainModeArg::Mainnet => ChainMode::Mainnet,
            ChainModeArg::Testnet => ChainMode::Testnet,
        }
    }
}

impl Args {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id,
            chain_mode: self.chain_mode.into(),
            caf_max_size_gb: self.caf_max_size_gb,
            caf_timeout_minutes: self.caf_timeout_minutes,
            prefetch: self.prefetch,
            temp_dir: self.temp_dir.clone(),
            download_timeout_ms: self.download_timeout_ms,
            keep_caf_files: !self.delete_caf_files,
            batch_ceiling: self.batch_ceiling,
            ..WorkerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.worker_config();
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {e}");
    }

    info!(
        worker_id = config.worker_id,
        chain = %config.chain_mode,
        budget_gb = config.caf_max_size_gb,
        "starting CAFIO worker"
    );

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .context("temp directory unavailable")?;

    // Catalog must be reachable and hold this worker's identity row.
    if let Some(parent) = args.catalog_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("catalog directory unavailable")?;
    }
    let catalog = Arc::new(
        RedbCatalog::open(&args.catalog_path).context("failed to open catalog")?,
    );
    match catalog.worker(config.worker_id).await? {
        Some(identity) => info!(address = identity.address, "worker identity loaded"),
        None if args.register_worker => {
            catalog
                .register_worker(config.worker_id, &args.worker_address, &args.worker_seed)
                .await
                .context("failed to register worker identity")?;
            info!("worker identity registered");
        }
        None => bail!(
            "no worker identity row for worker_id {} (run with --register-worker)",
            config.worker_id
        ),
    }

    let blob = Arc::new(
        FsBlobService::new(&args.blob_home, config.chain_mode)
            .await
            .context("blob store unavailable")?,
    );
    let store = Arc::new(FsObjectStore::new(&args.source_dir));
    let queue = Arc::new(
        DirQueue::open(&args.spool_dir)
            .await
            .context("spool directory unavailable")?,
    );

    let pipeline = Arc::new(PackingPipeline::new(
        PipelineConfig::from(&config),
        queue,
        store,
        blob.clone(),
        catalog.clone(),
    ));
    let pipeline_task = tokio::spawn(pipeline.run_until(async {
        tokio::signal::ctrl_c().await.ok();
    }));

    let app = cafio_facade::router(
        catalog,
        blob,
        FacadeConfig::from_worker(&config, args.allowed_origins.clone()),
    );

    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port()).into();
    info!(%addr, "starting retrieval facade");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;

    // Let the pipeline return its unacked work to the queue.
    pipeline_task.await.ok();
    info!("worker shut down gracefully");

    Ok(())
}
