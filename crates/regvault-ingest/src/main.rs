//! Regvault harvesting daemon.
//!
//! Discovers regulations.gov documents, downloads them with their
//! attachments, stores every piece on disk and indexes it in Elasticsearch.
//!
//! # Usage
//!
//! ```bash
//! # API key from the environment (or a .env file)
//! REGVAULT_API_KEY=... regvault-ingest
//!
//! # Custom locations
//! regvault-ingest \
//!     --checkpoint-db /data/checkpoints.db \
//!     --storage-dir /data/objects \
//!     --elasticsearch-url http://elasticsearch:9200
//!
//! # Only keep up with recent changes
//! regvault-ingest --no-backfill
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM stop discovery. Downloads already queued are
//! finished, stored and indexed before the process exits. The backfill
//! checkpoint is always current, so the next start resumes where this one
//! stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use regvault_core::Checkpoint;
use regvault_core::metrics::{init_metrics, start_metrics_server};
use regvault_ingest::checkpoint::load_json;
use regvault_ingest::{
    ElasticsearchBackend, FsObjectStore, HarvestConfig, Harvester, HttpTransport,
    SqliteCheckpointStore,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Regvault harvesting daemon.
#[derive(Parser, Debug)]
#[command(name = "regvault-ingest")]
#[command(about = "Rate-limited regulations.gov harvester")]
#[command(version)]
struct Args {
    /// api.data.gov key
    #[arg(long, env = "REGVAULT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API root URL
    #[arg(long, env = "REGVAULT_API_URL")]
    api_url: Option<String>,

    /// SQLite database for discovery checkpoints
    #[arg(long, env = "REGVAULT_CHECKPOINT_DB")]
    checkpoint_db: Option<PathBuf>,

    /// Root directory of the object store
    #[arg(long, short, env = "REGVAULT_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Elasticsearch URL (e.g., http://localhost:9200)
    #[arg(long, env = "ELASTICSEARCH_URL")]
    elasticsearch_url: Option<String>,

    /// Number of download workers
    #[arg(long, env = "REGVAULT_DOWNLOAD_WORKERS")]
    workers: Option<usize>,

    /// Window of the recent poll, in days
    #[arg(long, env = "REGVAULT_RECENT_DAYS")]
    recent_days: Option<u32>,

    /// Disable the full-corpus backfill
    #[arg(long)]
    no_backfill: bool,

    /// Disable the recently-modified poll
    #[arg(long)]
    no_recent: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "REGVAULT_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

impl Args {
    /// Command-line flags win over the environment.
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(key) = &self.api_key {
            config.transport.api_key = key.clone();
        }
        if let Some(url) = &self.api_url {
            config.transport.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = &self.checkpoint_db {
            config.checkpoint_path = path.clone();
        }
        if let Some(path) = &self.storage_dir {
            config.storage_root = path.clone();
        }
        if let Some(url) = &self.elasticsearch_url {
            config.elasticsearch.url = url.trim_end_matches('/').to_string();
        }
        if let Some(workers) = self.workers {
            config.download.workers = workers;
        }
        if let Some(days) = self.recent_days {
            config.discovery.recent_days = days;
        }
        if self.no_backfill {
            config.run_backfill = false;
        }
        if self.no_recent {
            config.run_recent = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,regvault_ingest=debug")),
        )
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    let args = Args::parse();

    tracing::info!("Regvault harvester starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
        gauge!("harvester_running").set(1.0);
        tracing::info!("Metrics server listening on port {}", args.metrics_port);
    }

    let mut config = HarvestConfig::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    tracing::info!("Opening checkpoint store at {}", config.checkpoint_path.display());
    let checkpoints = Arc::new(
        SqliteCheckpointStore::open(&config.checkpoint_path).with_context(|| {
            format!("Failed to open checkpoint store at {:?}", config.checkpoint_path)
        })?,
    );

    let store = FsObjectStore::open(&config.storage_root).with_context(|| {
        format!("Failed to open object store at {:?}", config.storage_root)
    })?;
    let backend = ElasticsearchBackend::new(config.elasticsearch.clone())
        .context("Failed to create Elasticsearch client")?;
    let transport =
        HttpTransport::new(config.transport.clone()).context("Failed to create HTTP client")?;

    let checkpoint_key = config.discovery.checkpoint_key.clone();
    let started = Instant::now();

    let result = Harvester::new(config, transport, store, backend, checkpoints.clone())
        .run(shutdown)
        .await;

    gauge!("harvester_running").set(0.0);

    let checkpoint: Option<Checkpoint> = load_json(checkpoints.as_ref(), &checkpoint_key)
        .context("Failed to read final checkpoint")?;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Uptime:               {:?}", started.elapsed());
    match checkpoint {
        Some(checkpoint) => {
            tracing::info!(
                "Known records:        {}",
                checkpoint.total_known_records.unwrap_or(0)
            );
            tracing::info!(
                "Pages pending:        {}",
                checkpoint.pending_historical_offsets.len()
            );
        }
        None => tracing::info!("Backfill checkpoint:  none"),
    }

    result.context("Harvester failed")
}
