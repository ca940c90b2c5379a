//! Search indexing of content items.
//!
//! Items are batched and bulk-written to a search backend. The target index
//! of an item is the configured prefix plus the year partition of its
//! document id (`regulations-2017`, `regulations-0000`, ...). Each partition
//! is created on first use with explicit shard and replica counts.
//!
//! # Retry Strategy
//!
//! When a bulk call fails or reports any per-item error, the entire original
//! batch is indexed again after `retry_delay`. Document ids are
//! `<documentId>/<tag>`, so repeating items that did succeed overwrites them
//! with identical content. Retries still pending at shutdown are abandoned
//! and every item they held is logged by document id and tag.

mod elasticsearch;

pub use elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant as StdInstant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use metrics::{counter, histogram};
use regvault_core::{ContentItem, ContentTag, index_name};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};

use crate::Result;

/// Shard layout of a new partition index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    pub shards: u32,
    pub replicas: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            shards: 5,
            replicas: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateIndexOutcome {
    Created,
    AlreadyExists,
}

/// One document of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub index: String,
    pub id: String,
    pub source: serde_json::Value,
}

/// Per-document result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub id: String,
    pub error: Option<String>,
}

/// A search engine that stores JSON documents in named indices.
pub trait SearchBackend: Send + Sync + 'static {
    /// Prepare server-side processing of indexed documents. Must be
    /// idempotent; called once before the first batch.
    fn ensure_pipeline(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Create an index unless it exists.
    fn create_index(
        &self,
        name: &str,
        settings: &IndexSettings,
    ) -> impl Future<Output = Result<CreateIndexOutcome>> + Send;

    /// Upsert documents by id. Returns one result per document.
    fn bulk(
        &self,
        documents: &[IndexDocument],
    ) -> impl Future<Output = Result<Vec<BulkItemResult>>> + Send;
}

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Prefix of every partition index name.
    pub prefix: String,
    /// Maximum items per bulk request.
    pub batch_size: usize,
    /// Flush a partial batch after this long.
    pub flush_interval: Duration,
    /// Delay before a failed batch is indexed again.
    pub retry_delay: Duration,
    pub settings: IndexSettings,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            prefix: "regulations-".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(60),
            settings: IndexSettings::default(),
        }
    }
}

/// Result of indexing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    /// `(documentId/tag, reason)` for every rejected item.
    pub failed: Vec<(String, String)>,
}

/// Writes batches of content items to a [`SearchBackend`].
pub struct Indexer<B: SearchBackend> {
    config: IndexerConfig,
    backend: B,
    /// Partitions known to exist.
    partitions: HashSet<String>,
}

impl<B: SearchBackend> Indexer<B> {
    pub fn new(config: IndexerConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            partitions: HashSet::new(),
        }
    }

    /// Spawn the batching loop on `items`.
    pub fn spawn(self, items: mpsc::Receiver<ContentItem>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(items))
    }

    /// Index one batch, creating any missing partition first.
    ///
    /// An `Err` means nothing can be said about the batch, typically because
    /// the backend was unreachable.
    pub async fn index_batch(&mut self, items: &[ContentItem]) -> Result<BatchOutcome> {
        let documents: Vec<IndexDocument> = items
            .iter()
            .map(|item| index_document(&self.config.prefix, item))
            .collect();

        for document in &documents {
            self.ensure_partition(&document.index).await?;
        }

        let started = StdInstant::now();
        let results = self.backend.bulk(&documents).await?;
        histogram!("index_bulk_duration_seconds").record(started.elapsed().as_secs_f64());

        let mut outcome = BatchOutcome::default();
        for result in results {
            match result.error {
                None => outcome.succeeded += 1,
                Some(reason) => outcome.failed.push((result.id, reason)),
            }
        }
        counter!("index_documents_indexed_total").increment(outcome.succeeded as u64);
        Ok(outcome)
    }

    async fn ensure_partition(&mut self, index: &str) -> Result<()> {
        if self.partitions.contains(index) {
            return Ok(());
        }
        let outcome = self.backend.create_index(index, &self.config.settings).await?;
        if outcome == CreateIndexOutcome::Created {
            counter!("index_partitions_created_total").increment(1);
            tracing::info!(index, "Created partition index");
        }
        self.partitions.insert(index.to_string());
        Ok(())
    }

    /// Batch items until the channel closes, then flush what is left.
    pub async fn run(mut self, mut items: mpsc::Receiver<ContentItem>) -> Result<()> {
        self.backend.ensure_pipeline().await?;

        let mut batch: Vec<ContentItem> = Vec::with_capacity(self.config.batch_size);
        let mut deadline: Option<Instant> = None;
        let mut retries = RetryQueue::new(self.config.retry_delay);

        loop {
            // Timers first so a busy channel cannot starve flushes and retries
            tokio::select! {
                biased;

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let partial = std::mem::take(&mut batch);
                    self.flush(partial, &mut retries).await;
                }

                Some(retry) = retries.next(), if !retries.is_empty() => {
                    tracing::info!(items = retry.len(), "Retrying failed index batch");
                    self.flush(retry, &mut retries).await;
                }

                item = items.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        deadline.get_or_insert_with(|| Instant::now() + self.config.flush_interval);
                        if batch.len() >= self.config.batch_size {
                            deadline = None;
                            let full = std::mem::take(&mut batch);
                            self.flush(full, &mut retries).await;
                        }
                    }
                    None => break,
                },
            }
        }

        if !batch.is_empty() {
            let last = std::mem::take(&mut batch);
            self.flush(last, &mut retries).await;
        }

        retries.abandon();

        tracing::info!("Indexer stopped");
        Ok(())
    }

    async fn flush(&mut self, batch: Vec<ContentItem>, retries: &mut RetryQueue) {
        if batch.is_empty() {
            return;
        }

        match self.index_batch(&batch).await {
            Ok(outcome) if outcome.failed.is_empty() => {
                tracing::debug!(indexed = outcome.succeeded, "Indexed batch");
                return;
            }
            Ok(outcome) => {
                counter!("index_bulk_errors_total").increment(outcome.failed.len() as u64);
                for (id, reason) in &outcome.failed {
                    tracing::warn!(id, reason, "Document rejected by search backend");
                }
                tracing::warn!(
                    succeeded = outcome.succeeded,
                    failed = outcome.failed.len(),
                    "Bulk request reported errors, scheduling batch retry"
                );
            }
            Err(e) => {
                counter!("index_bulk_errors_total").increment(batch.len() as u64);
                tracing::error!(
                    items = batch.len(),
                    error = %e,
                    "Bulk request failed, scheduling batch retry"
                );
            }
        }

        counter!("index_batch_retries_total").increment(1);
        retries.schedule(batch);
    }
}

/// Failed batches waiting out their retry delay.
struct RetryQueue {
    delay: Duration,
    timers: JoinSet<Vec<ContentItem>>,
    /// Items of each scheduled batch, for reporting what a lost timer held.
    contents: HashMap<task::Id, Vec<(String, ContentTag)>>,
}

impl RetryQueue {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: JoinSet::new(),
            contents: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn schedule(&mut self, batch: Vec<ContentItem>) {
        let contents = batch
            .iter()
            .map(|item| (item.document_id.clone(), item.tag))
            .collect();
        let delay = self.delay;
        let timer = self.timers.spawn(async move {
            sleep(delay).await;
            batch
        });
        self.contents.insert(timer.id(), contents);
    }

    /// The next batch whose delay has elapsed, or `None` once nothing is
    /// scheduled.
    async fn next(&mut self) -> Option<Vec<ContentItem>> {
        while let Some(joined) = self.timers.join_next_with_id().await {
            match joined {
                Ok((id, batch)) => {
                    self.contents.remove(&id);
                    return Some(batch);
                }
                Err(e) if e.is_cancelled() => {
                    self.contents.remove(&e.id());
                }
                Err(e) => {
                    let lost = self.contents.remove(&e.id()).unwrap_or_default();
                    tracing::error!(error = %e, items = lost.len(), "Index retry timer failed");
                    report_dropped(&lost, "Index retry lost");
                }
            }
        }
        None
    }

    /// Cancel every pending retry, logging each item that will not be
    /// indexed. Returns those items.
    fn abandon(&mut self) -> Vec<(String, ContentTag)> {
        self.timers.abort_all();
        let mut dropped: Vec<(String, ContentTag)> =
            self.contents.drain().flat_map(|(_, items)| items).collect();
        dropped.sort();

        if !dropped.is_empty() {
            tracing::warn!(items = dropped.len(), "Abandoning pending index retries at shutdown");
            report_dropped(&dropped, "Index retry abandoned at shutdown");
        }
        dropped
    }
}

fn report_dropped(items: &[(String, ContentTag)], message: &'static str) {
    for (document_id, tag) in items {
        tracing::warn!(document_id = %document_id, tag = %tag, "{}", message);
    }
}

/// Bulk document for an item.
pub fn index_document(prefix: &str, item: &ContentItem) -> IndexDocument {
    IndexDocument {
        index: index_name(prefix, &item.document_id),
        id: item.key(),
        source: json!({
            "documentId": item.document_id,
            "tag": item.tag.to_string(),
            "contentType": item.content_type,
            "originalFilename": item.original_filename,
            "sourceUrl": item.source_url,
            "retrievedAt": item.retrieved_at.to_rfc3339(),
            "data": BASE64.encode(&item.data),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySearchBackend;
    use bytes::Bytes;
    use regvault_core::ContentTag;

    fn item(document_id: &str, tag: ContentTag) -> ContentItem {
        ContentItem {
            document_id: document_id.to_string(),
            tag,
            data: Bytes::from_static(b"hello"),
            content_type: Some("text/plain".to_string()),
            original_filename: None,
            source_url: None,
            retrieved_at: chrono::Utc::now(),
        }
    }

    fn config(batch_size: usize) -> IndexerConfig {
        IndexerConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_index_document_source() {
        let document = index_document("regulations-", &item("EPA-HQ-2017-0001", ContentTag::Document));
        assert_eq!(document.index, "regulations-2017");
        assert_eq!(document.id, "EPA-HQ-2017-0001/document");
        assert_eq!(document.source["documentId"], "EPA-HQ-2017-0001");
        assert_eq!(document.source["tag"], "document");
        assert_eq!(document.source["contentType"], "text/plain");
        assert_eq!(document.source["data"], "aGVsbG8=");
    }

    #[tokio::test]
    async fn test_partitions_created_lazily_once() {
        let backend = MemorySearchBackend::new();
        let mut indexer = Indexer::new(config(100), backend.clone());

        let batch = vec![
            item("EPA-HQ-2017-0001", ContentTag::Document),
            item("EPA-HQ-2017-0001", ContentTag::Reference),
            item("FDA-1999-N-0001", ContentTag::Document),
            item("NOYEAR-0001", ContentTag::Document),
        ];
        let outcome = indexer.index_batch(&batch).await.unwrap();
        assert_eq!(outcome.succeeded, 4);
        assert!(outcome.failed.is_empty());
        assert_eq!(
            backend.index_names(),
            vec!["regulations-0000", "regulations-1999", "regulations-2017"]
        );
        assert_eq!(backend.create_calls(), 3);

        indexer.index_batch(&batch).await.unwrap();
        assert_eq!(backend.create_calls(), 3);
        assert_eq!(backend.document_keys().len(), 4);
    }

    #[tokio::test]
    async fn test_existing_partition_is_success() {
        let backend = MemorySearchBackend::new();
        backend.preexisting_index("regulations-2017");
        let mut indexer = Indexer::new(config(100), backend.clone());

        let outcome = indexer
            .index_batch(&[item("EPA-HQ-2017-0001", ContentTag::Document)])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert!(backend.document("regulations-2017", "EPA-HQ-2017-0001/document").is_some());
    }

    #[tokio::test]
    async fn test_partial_failure_reported() {
        let backend = MemorySearchBackend::new();
        backend.fail_next_bulks(1);
        let mut indexer = Indexer::new(config(100), backend.clone());

        let outcome = indexer
            .index_batch(&[item("EPA-HQ-2017-0001", ContentTag::Document)])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed[0].0, "EPA-HQ-2017-0001/document");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_full_batches_and_final_partial() {
        let backend = MemorySearchBackend::new();
        let (tx, rx) = mpsc::channel(16);
        let task = Indexer::new(config(2), backend.clone()).spawn(rx);

        for n in 0..5 {
            tx.send(item(&format!("EPA-2017-{n:04}"), ContentTag::Document))
                .await
                .unwrap();
        }
        drop(tx);
        task.await.unwrap().unwrap();

        assert_eq!(backend.document_keys().len(), 5);
        assert_eq!(backend.bulk_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_after_interval() {
        let backend = MemorySearchBackend::new();
        let (tx, rx) = mpsc::channel(16);
        let task = Indexer::new(config(100), backend.clone()).spawn(rx);

        tx.send(item("EPA-2017-0001", ContentTag::Document)).await.unwrap();
        sleep(Duration::from_secs(4)).await;
        assert_eq!(backend.bulk_calls(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.bulk_calls(), 1);
        assert_eq!(backend.document_keys().len(), 1);

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_retried_whole_after_delay() {
        let backend = MemorySearchBackend::new();
        backend.fail_next_bulks(1);
        let (tx, rx) = mpsc::channel(16);
        let task = Indexer::new(config(2), backend.clone()).spawn(rx);

        tx.send(item("EPA-2017-0001", ContentTag::Document)).await.unwrap();
        tx.send(item("EPA-2017-0002", ContentTag::Document)).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.bulk_calls(), 1);
        assert!(backend.document_keys().is_empty());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.bulk_calls(), 2);
        assert_eq!(backend.document_keys().len(), 2);

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_queue_releases_after_delay() {
        let mut retries = RetryQueue::new(Duration::from_secs(60));
        retries.schedule(vec![item("EPA-2017-0001", ContentTag::Document)]);
        assert!(!retries.is_empty());

        let start = Instant::now();
        let batch = retries.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(batch[0].document_id, "EPA-2017-0001");
        assert!(retries.is_empty());
        assert!(retries.abandon().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_reports_every_pending_item() {
        let mut retries = RetryQueue::new(Duration::from_secs(60));
        retries.schedule(vec![
            item("EPA-2017-0002", ContentTag::Document),
            item("EPA-2017-0001", ContentTag::Reference),
        ]);
        retries.schedule(vec![item("FDA-1999-0001", ContentTag::Download { format: 0 })]);

        let dropped = retries.abandon();
        assert_eq!(
            dropped,
            vec![
                ("EPA-2017-0001".to_string(), ContentTag::Reference),
                ("EPA-2017-0002".to_string(), ContentTag::Document),
                ("FDA-1999-0001".to_string(), ContentTag::Download { format: 0 }),
            ]
        );
        // Aborted timers never release their batches
        assert!(retries.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_abandoned_on_shutdown() {
        let backend = MemorySearchBackend::new();
        backend.fail_next_bulks(1);
        let (tx, rx) = mpsc::channel(16);
        let task = Indexer::new(config(1), backend.clone()).spawn(rx);

        tx.send(item("EPA-2017-0001", ContentTag::Document)).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        drop(tx);
        task.await.unwrap().unwrap();

        assert_eq!(backend.bulk_calls(), 1);
        assert!(backend.document_keys().is_empty());
    }
}
