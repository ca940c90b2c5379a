//! Discovery of document references from the upstream listing API.
//!
//! Two drivers share the gateway:
//!
//! - [`RecentPoller`] walks "modified in the last N days" from offset 0 on a
//!   fixed interval. It keeps no state across runs.
//! - [`BackfillDriver`] walks the whole corpus page by page, newest pages
//!   first, and records its progress in a [`Checkpoint`](regvault_core::Checkpoint)
//!   so a restart resumes where it stopped.
//!
//! Both hand every reference to a [`ReferenceSink`], normally the download
//! coordinator.

mod backfill;
mod recent;

pub use backfill::{BackfillDriver, DiscoveryPhase};
pub use recent::RecentPoller;

use std::future::Future;
use std::time::Duration;

use regvault_core::{DocumentReference, DocumentsPage, MAX_PAGE_SIZE};
use tokio::sync::mpsc;

use crate::gateway::{FetchError, GatewayHandle, ListQuery, UpstreamRequest};
use crate::supervisor::RestartPolicy;
use crate::{Error, Result};

/// Configuration shared by both discovery drivers.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Records per listing page.
    pub page_size: u64,
    /// Window of the recent poll, in days.
    pub recent_days: u32,
    /// Time between recent polls.
    pub recent_interval: Duration,
    /// Time between checks for corpus growth during backfill.
    pub extension_interval: Duration,
    /// Wait before retrying a page that came back empty too early.
    pub lag_retry_interval: Duration,
    /// Checkpoint store key of the backfill state.
    pub checkpoint_key: String,
    /// Hold the next backfill page until the downloader has drained.
    pub await_batch_completion: bool,
    /// Budget for transient listing failures.
    pub restart_policy: RestartPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            recent_days: 1,
            recent_interval: Duration::from_secs(24 * 60 * 60),
            extension_interval: Duration::from_secs(5 * 60),
            lag_retry_interval: Duration::from_secs(60),
            checkpoint_key: "discovery.backfill.checkpoint".to_string(),
            await_batch_completion: true,
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Receiver of discovered references.
pub trait ReferenceSink: Send + Sync + 'static {
    /// Hand one reference downstream.
    fn accept(&self, reference: DocumentReference) -> impl Future<Output = Result<()>> + Send;

    /// Resolve once everything accepted so far has been fully processed.
    fn wait_idle(&self) -> impl Future<Output = ()> + Send;
}

impl ReferenceSink for mpsc::Sender<DocumentReference> {
    async fn accept(&self, reference: DocumentReference) -> Result<()> {
        self.send(reference)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    async fn wait_idle(&self) {}
}

/// Fetch and decode one listing page.
///
/// An undecodable body is treated like a server error.
pub(crate) async fn fetch_page(
    gateway: &GatewayHandle,
    query: ListQuery,
) -> std::result::Result<DocumentsPage, FetchError> {
    let offset = query.page_offset;
    let response = gateway
        .execute(UpstreamRequest::ListDocuments(query))
        .await?;

    DocumentsPage::from_slice(&response.body).map_err(|e| {
        tracing::warn!(offset, error = %e, "Undecodable listing page");
        FetchError::Transient(format!("undecodable listing page: {e}"))
    })
}
