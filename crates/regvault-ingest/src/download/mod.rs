//! Download coordinator.
//!
//! A fixed pool of single-flight workers turns document references into
//! content items:
//!
//! ```text
//! DocumentReference ──▶ worker (round-robin)
//!                         │ GET document body
//!                         ├──▶ emit `reference`, `document`
//!                         └──▶ queue one file request per attachment format
//!                              and per top-level format
//!                                   │ GET download
//!                                   └──▶ emit `attachment.<n>-<i>` / `download.<i>`
//! ```
//!
//! Every emitted item goes to all [`ContentFanout`] sinks (storage and
//! search). Outstanding `(documentId, tag)` pairs are tracked so callers can
//! wait for the pool to drain.

mod tracker;
mod worker;

pub use tracker::InProgress;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regvault_core::{ContentItem, ContentTag, DocumentReference, FileRequest};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::discovery::ReferenceSink;
use crate::gateway::GatewayHandle;
use crate::supervisor::RestartPolicy;
use crate::{Error, Result};
use worker::Worker;

/// Configuration for the download pool.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Number of workers.
    pub workers: usize,
    /// Restart budget of each worker.
    pub restart_policy: RestartPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Unit of work for a download worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadRequest {
    /// Fetch a document body and derive its file requests.
    Document(DocumentReference),
    /// Fetch one binary.
    File(FileRequest),
}

impl DownloadRequest {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Document(reference) => &reference.document_id,
            Self::File(file) => &file.document_id,
        }
    }

    /// Tag under which this request is tracked.
    pub fn tag(&self) -> ContentTag {
        match self {
            Self::Document(_) => ContentTag::Document,
            Self::File(file) => file.tag,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Document(_) => None,
            Self::File(file) => Some(&file.url),
        }
    }
}

/// Delivers each content item to every downstream consumer.
#[derive(Clone)]
pub struct ContentFanout {
    sinks: Arc<Vec<mpsc::Sender<ContentItem>>>,
}

impl ContentFanout {
    pub fn new(sinks: Vec<mpsc::Sender<ContentItem>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Send an item to every sink, waiting for capacity.
    pub async fn emit(&self, item: ContentItem) -> Result<()> {
        for sink in self.sinks.iter() {
            sink.send(item.clone())
                .await
                .map_err(|e| Error::ChannelSend(format!("content sink closed: {}", e)))?;
        }
        Ok(())
    }
}

/// Cloneable handle for submitting references to the pool.
#[derive(Clone)]
pub struct DownloadHandle {
    workers: Arc<Vec<mpsc::UnboundedSender<DownloadRequest>>>,
    next: Arc<AtomicUsize>,
    tracker: Arc<InProgress>,
}

impl DownloadHandle {
    /// Queue a document. Returns `false` if it is already in progress.
    pub fn submit(&self, reference: DocumentReference) -> Result<bool> {
        let document_id = reference.document_id.clone();
        if !self.tracker.register(&document_id, ContentTag::Document) {
            tracing::debug!(%document_id, "Document already in progress, skipping");
            return Ok(false);
        }

        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[slot]
            .send(DownloadRequest::Document(reference))
            .is_err()
        {
            self.tracker.complete(&document_id, ContentTag::Document);
            return Err(Error::ChannelSend(format!(
                "download worker {slot} has stopped"
            )));
        }
        Ok(true)
    }

    /// Outstanding `(documentId, tag)` pairs.
    pub fn in_progress(&self) -> usize {
        self.tracker.len()
    }

    /// Resolve once every submitted document has been fully downloaded.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await
    }
}

impl ReferenceSink for DownloadHandle {
    async fn accept(&self, reference: DocumentReference) -> Result<()> {
        self.submit(reference).map(|_| ())
    }

    async fn wait_idle(&self) {
        self.tracker.wait_idle().await
    }
}

/// Spawns and supervises the worker pool.
pub struct DownloadCoordinator;

impl DownloadCoordinator {
    /// Start the pool.
    ///
    /// The returned task finishes once every handle has been dropped and all
    /// queued work is done, or fails as soon as one worker exhausts its
    /// restart budget.
    pub fn spawn(
        config: DownloadConfig,
        gateway: GatewayHandle,
        fanout: ContentFanout,
    ) -> (DownloadHandle, JoinHandle<Result<()>>) {
        let tracker = Arc::new(InProgress::new());
        let mut senders = Vec::with_capacity(config.workers.max(1));
        let mut workers = JoinSet::new();

        for id in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            let worker = Worker::new(
                id,
                gateway.clone(),
                fanout.clone(),
                Arc::clone(&tracker),
                rx,
                config.restart_policy,
            );
            workers.spawn(worker.run());
        }

        tracing::info!(workers = senders.len(), "Download pool started");

        let handle = DownloadHandle {
            workers: Arc::new(senders),
            next: Arc::new(AtomicUsize::new(0)),
            tracker,
        };
        let task = tokio::spawn(supervise(workers));

        (handle, task)
    }
}

async fn supervise(mut workers: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Download worker failed, stopping pool");
                workers.abort_all();
                return Err(e);
            }
            Err(e) => {
                workers.abort_all();
                return Err(Error::Task(format!("download worker: {}", e)));
            }
        }
    }
    tracing::info!("Download pool stopped");
    Ok(())
}
