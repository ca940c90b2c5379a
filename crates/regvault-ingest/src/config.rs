//! Harvester configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regvault_core::MAX_PAGE_SIZE;

use crate::discovery::DiscoveryConfig;
use crate::download::DownloadConfig;
use crate::gateway::{GatewayConfig, HttpTransportConfig};
use crate::index::{ElasticsearchConfig, IndexerConfig};
use crate::persist::PersistConfig;
use crate::supervisor::RestartPolicy;
use crate::{Error, Result};

/// Complete configuration of one harvester process.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub transport: HttpTransportConfig,
    pub gateway: GatewayConfig,
    pub discovery: DiscoveryConfig,
    pub download: DownloadConfig,
    pub persist: PersistConfig,
    pub indexer: IndexerConfig,
    pub elasticsearch: ElasticsearchConfig,
    /// SQLite file holding discovery checkpoints.
    pub checkpoint_path: PathBuf,
    /// Root directory of the filesystem object store.
    pub storage_root: PathBuf,
    /// Run the checkpointed full-corpus walk.
    pub run_backfill: bool,
    /// Run the periodic recently-modified poll.
    pub run_recent: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            transport: HttpTransportConfig::default(),
            gateway: GatewayConfig::default(),
            discovery: DiscoveryConfig::default(),
            download: DownloadConfig::default(),
            persist: PersistConfig::default(),
            indexer: IndexerConfig::default(),
            elasticsearch: ElasticsearchConfig::default(),
            checkpoint_path: PathBuf::from("./data/checkpoints.db"),
            storage_root: PathBuf::from("./data/objects"),
            run_backfill: true,
            run_recent: true,
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment variables.
    ///
    /// Required at run time (see [`HarvestConfig::validate`]):
    /// - `REGVAULT_API_KEY`: api.data.gov key
    ///
    /// Optional:
    /// - `REGVAULT_API_URL`: API root (default: "https://api.data.gov")
    /// - `REGVAULT_CHECKPOINT_DB`: checkpoint database (default: "./data/checkpoints.db")
    /// - `REGVAULT_STORAGE_DIR`: object store root (default: "./data/objects")
    /// - `REGVAULT_ROOT_CONTAINER`: top-level container (default: "regulations")
    /// - `ELASTICSEARCH_URL`: search cluster (default: "http://localhost:9200")
    /// - `REGVAULT_INDEX_PREFIX`: partition index prefix (default: "regulations-")
    /// - `REGVAULT_INDEX_BATCH_SIZE`: documents per bulk request (default: 100)
    /// - `REGVAULT_INDEX_FLUSH_SECS`: partial batch flush interval (default: 5)
    /// - `REGVAULT_INDEX_RETRY_SECS`: failed batch retry delay (default: 60)
    /// - `REGVAULT_INDEX_SHARDS` / `REGVAULT_INDEX_REPLICAS`: partition layout (default: 5 / 1)
    /// - `REGVAULT_DOWNLOAD_WORKERS`: download pool size (default: 2)
    /// - `REGVAULT_PAGE_SIZE`: listing page size, at most 1000 (default: 1000)
    /// - `REGVAULT_RECENT_DAYS`: recent poll window in days (default: 1)
    /// - `REGVAULT_QUOTA_SOFT_THRESHOLD`: proactive cooldown threshold (default: 5)
    /// - `REGVAULT_SOFT_COOLDOWN_SECS` / `REGVAULT_HARD_COOLDOWN_SECS`: pauses (default: 60 / 300)
    /// - `REGVAULT_MAX_RESTARTS` / `REGVAULT_RESTART_WINDOW_SECS`: restart budget (default: 10 / 60)
    /// - `REGVAULT_BACKFILL` / `REGVAULT_RECENT`: enable discovery modes (default: true)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = var("REGVAULT_API_KEY") {
            config.transport.api_key = key;
        }
        if let Some(url) = var("REGVAULT_API_URL") {
            config.transport.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = var("REGVAULT_CHECKPOINT_DB") {
            config.checkpoint_path = PathBuf::from(path);
        }
        if let Some(path) = var("REGVAULT_STORAGE_DIR") {
            config.storage_root = PathBuf::from(path);
        }
        if let Some(name) = var("REGVAULT_ROOT_CONTAINER") {
            config.persist.root_container = name;
        }
        if let Some(url) = var("ELASTICSEARCH_URL") {
            config.elasticsearch.url = url.trim_end_matches('/').to_string();
        }
        if let Some(prefix) = var("REGVAULT_INDEX_PREFIX") {
            config.indexer.prefix = prefix;
        }

        if let Some(n) = parsed("REGVAULT_INDEX_BATCH_SIZE")? {
            config.indexer.batch_size = n;
        }
        if let Some(secs) = parsed("REGVAULT_INDEX_FLUSH_SECS")? {
            config.indexer.flush_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("REGVAULT_INDEX_RETRY_SECS")? {
            config.indexer.retry_delay = Duration::from_secs(secs);
        }
        if let Some(n) = parsed("REGVAULT_INDEX_SHARDS")? {
            config.indexer.settings.shards = n;
        }
        if let Some(n) = parsed("REGVAULT_INDEX_REPLICAS")? {
            config.indexer.settings.replicas = n;
        }
        if let Some(n) = parsed("REGVAULT_DOWNLOAD_WORKERS")? {
            config.download.workers = n;
        }
        if let Some(n) = parsed("REGVAULT_PAGE_SIZE")? {
            config.discovery.page_size = n;
        }
        if let Some(days) = parsed("REGVAULT_RECENT_DAYS")? {
            config.discovery.recent_days = days;
        }
        if let Some(n) = parsed("REGVAULT_QUOTA_SOFT_THRESHOLD")? {
            config.gateway.soft_threshold = n;
        }
        if let Some(secs) = parsed("REGVAULT_SOFT_COOLDOWN_SECS")? {
            config.gateway.soft_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("REGVAULT_HARD_COOLDOWN_SECS")? {
            config.gateway.hard_cooldown = Duration::from_secs(secs);
        }

        let mut policy = RestartPolicy::default();
        if let Some(n) = parsed("REGVAULT_MAX_RESTARTS")? {
            policy.max_restarts = n;
        }
        if let Some(secs) = parsed("REGVAULT_RESTART_WINDOW_SECS")? {
            policy.window = Duration::from_secs(secs);
        }
        config.set_restart_policy(policy);

        if let Some(on) = parsed("REGVAULT_BACKFILL")? {
            config.run_backfill = on;
        }
        if let Some(on) = parsed("REGVAULT_RECENT")? {
            config.run_recent = on;
        }

        tracing::info!(
            api_url = %config.transport.base_url,
            checkpoint_db = %config.checkpoint_path.display(),
            storage_dir = %config.storage_root.display(),
            elasticsearch_url = %config.elasticsearch.url,
            workers = config.download.workers,
            page_size = config.discovery.page_size,
            backfill = config.run_backfill,
            recent = config.run_recent,
            "harvester configuration loaded"
        );

        Ok(config)
    }

    /// Apply one restart budget to every supervised component.
    pub fn set_restart_policy(&mut self, policy: RestartPolicy) {
        self.discovery.restart_policy = policy;
        self.download.restart_policy = policy;
        self.persist.restart_policy = policy;
    }

    /// Reject settings the harvester cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transport.api_key.is_empty() {
            return Err(Error::Config("REGVAULT_API_KEY is not set".to_string()));
        }
        if self.discovery.page_size == 0 || self.discovery.page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.discovery.page_size
            )));
        }
        if self.download.workers == 0 {
            return Err(Error::Config("at least one download worker is required".to_string()));
        }
        if self.indexer.batch_size == 0 {
            return Err(Error::Config("index batch size must be positive".to_string()));
        }
        if !self.run_backfill && !self.run_recent {
            return Err(Error::Config("both discovery modes are disabled".to_string()));
        }
        Ok(())
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}
