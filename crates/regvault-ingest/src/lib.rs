//! Regvault harvesting pipeline.
//!
//! This crate discovers documents published through the regulations.gov API,
//! downloads each document with all of its attachments, writes every piece to
//! object storage and indexes it for full-text search.
//!
//! # Modules
//!
//! - [`gateway`] - Rate-limited request gateway and the HTTP transport
//! - [`discovery`] - Recent poller and checkpointed backfill driver
//! - [`download`] - Worker pool turning references into content items
//! - [`persist`] - Idempotent object storage writer
//! - [`index`] - Batched, retrying search indexer
//! - [`checkpoint`] - Durable storage of discovery progress
//! - [`supervisor`] - Restart budgets for crash-prone components
//! - [`pipeline`] - Wiring and shutdown of all of the above
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Discovery    │  recent poll + checkpointed backfill
//! └────────┬────────┘
//!          │ DocumentReference
//!          ▼
//! ┌─────────────────┐      ┌─────────────┐
//! │    Downloads    │ ───▶ │   Gateway   │ ───▶ regulations.gov
//! └────────┬────────┘      └─────────────┘
//!          │ ContentItem
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌────────┐ ┌────────┐
//! │Persist │ │ Index  │
//! └────────┘ └────────┘
//! ```
//!
//! Object storage is the record of what was fetched; the search index is
//! derived from the same items.

pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod download;
pub mod error;
pub mod gateway;
pub mod index;
pub mod persist;
pub mod pipeline;
pub mod supervisor;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use checkpoint::{CheckpointStore, SqliteCheckpointStore};
pub use config::HarvestConfig;
pub use discovery::{BackfillDriver, DiscoveryConfig, DiscoveryPhase, RecentPoller, ReferenceSink};
pub use download::{ContentFanout, DownloadConfig, DownloadCoordinator, DownloadHandle, DownloadRequest};
pub use gateway::{
    FetchError, Gateway, GatewayConfig, GatewayHandle, HttpTransport, HttpTransportConfig,
    RateLimitState, Transport,
};
pub use index::{
    BatchOutcome, ElasticsearchBackend, ElasticsearchConfig, Indexer, IndexerConfig, SearchBackend,
};
pub use persist::{FsObjectStore, ObjectStore, PersistConfig, Persister};
pub use pipeline::Harvester;
pub use supervisor::{RestartBudget, RestartPolicy};
