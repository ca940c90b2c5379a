//! Checkpointed historical backfill.
//!
//! # Key Design
//!
//! - On first run a zero-result query learns the corpus size and the full
//!   set of page offsets is written as the initial checkpoint.
//! - Pending offsets are processed highest first. The server sorts by posted
//!   date ascending, so this favors fresher documents.
//! - An offset leaves the checkpoint only after its references have been
//!   handed downstream, and the checkpoint is written before the next page is
//!   requested. A crash re-fetches at most one page.
//! - A timer re-queries the total and appends offsets for any growth.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::{counter, gauge};
use regvault_core::Checkpoint;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{DiscoveryConfig, ReferenceSink, fetch_page};
use crate::checkpoint::{CheckpointStore, load_json, save_json};
use crate::gateway::{FetchError, GatewayHandle, ListQuery};
use crate::supervisor::RestartBudget;
use crate::{Error, Result};

/// What the backfill driver is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    /// Fetching listing pages.
    Discovering,
    /// Waiting for the downloader to finish the last page's documents.
    Downloading,
}

impl DiscoveryPhase {
    /// Value exported on the `discovery_phase` gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            Self::Discovering => 0.0,
            Self::Downloading => 1.0,
        }
    }
}

/// Walks the whole corpus and records progress in a checkpoint.
pub struct BackfillDriver<K: ReferenceSink> {
    config: DiscoveryConfig,
    gateway: GatewayHandle,
    store: Arc<dyn CheckpointStore>,
    sink: K,
    checkpoint: Checkpoint,
    /// Offsets rejected permanently during this run. They stay pending in the
    /// stored checkpoint so the next run tries them again.
    parked: BTreeSet<u64>,
    phase: DiscoveryPhase,
    budget: RestartBudget,
    shutdown: CancellationToken,
}

impl<K: ReferenceSink> BackfillDriver<K> {
    pub fn new(
        config: DiscoveryConfig,
        gateway: GatewayHandle,
        store: Arc<dyn CheckpointStore>,
        sink: K,
        shutdown: CancellationToken,
    ) -> Self {
        let budget = RestartBudget::new("backfill", config.restart_policy);
        Self {
            config,
            gateway,
            store,
            sink,
            checkpoint: Checkpoint::default(),
            parked: BTreeSet::new(),
            phase: DiscoveryPhase::Discovering,
            budget,
            shutdown,
        }
    }

    /// Run until shutdown.
    ///
    /// Returns an error only for failures the driver cannot absorb: a store
    /// write failing, the restart budget running out, or the corpus size
    /// being unobtainable.
    pub async fn run(mut self) -> Result<()> {
        let Some(checkpoint) = self.load_or_initialize().await? else {
            return Ok(());
        };
        self.checkpoint = checkpoint;
        self.publish_gauges();

        let mut next_extension = Instant::now() + self.config.extension_interval;

        while !self.shutdown.is_cancelled() {
            if Instant::now() >= next_extension {
                self.extend().await?;
                next_extension = Instant::now() + self.config.extension_interval;
                continue;
            }

            match self.next_offset() {
                Some(offset) => self.process(offset).await?,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep_until(next_extension) => {}
                    }
                }
            }
        }

        tracing::info!(
            pending = self.checkpoint.pending_historical_offsets.len(),
            parked = self.parked.len(),
            "Backfill driver stopped"
        );
        Ok(())
    }

    fn next_offset(&self) -> Option<u64> {
        self.checkpoint
            .offsets_descending()
            .find(|offset| !self.parked.contains(offset))
    }

    async fn load_or_initialize(&mut self) -> Result<Option<Checkpoint>> {
        let key = self.config.checkpoint_key.clone();
        if let Some(checkpoint) = load_json::<Checkpoint, _>(self.store.as_ref(), &key)?
            && checkpoint.is_initialized()
        {
            tracing::info!(
                total = checkpoint.total_known_records,
                pending = checkpoint.pending_historical_offsets.len(),
                "Resuming backfill from checkpoint"
            );
            return Ok(Some(checkpoint));
        }

        while !self.shutdown.is_cancelled() {
            match fetch_page(&self.gateway, ListQuery::count()).await {
                Ok(page) => {
                    let checkpoint =
                        Checkpoint::from_total(page.total_num_records, self.config.page_size);
                    save_json(self.store.as_ref(), &key, &checkpoint)?;
                    tracing::info!(
                        total = page.total_num_records,
                        pages = checkpoint.pending_historical_offsets.len(),
                        "Initialized backfill checkpoint"
                    );
                    return Ok(Some(checkpoint));
                }
                Err(e) => self.absorb_failure(e)?,
            }
        }

        Ok(None)
    }

    async fn process(&mut self, offset: u64) -> Result<()> {
        let total = self.checkpoint.total_known_records.unwrap_or(0);
        let query = ListQuery::backfill(self.config.page_size, offset);

        let page = match fetch_page(&self.gateway, query).await {
            Ok(page) => page,
            Err(FetchError::Permanent { status }) => {
                tracing::error!(offset, status, "Listing page rejected, parking offset until restart");
                self.parked.insert(offset);
                return Ok(());
            }
            Err(FetchError::InvalidRequest(reason)) => {
                tracing::error!(offset, %reason, "Listing request invalid, parking offset until restart");
                self.parked.insert(offset);
                return Ok(());
            }
            Err(e) => return self.absorb_failure(e),
        };

        if page.documents.is_empty() && offset < total {
            counter!("discovery_upstream_lag_total").increment(1);
            tracing::info!(
                offset,
                total,
                wait = ?self.config.lag_retry_interval,
                "Empty page before reported total, waiting for upstream"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = sleep(self.config.lag_retry_interval) => {}
            }
            return Ok(());
        }

        let emitted = page.documents.len();
        for reference in page.documents {
            self.sink.accept(reference).await?;
        }

        self.checkpoint.complete(offset);
        self.save()?;

        counter!("discovery_pages_fetched_total", "mode" => "backfill").increment(1);
        counter!("discovery_references_emitted_total", "mode" => "backfill")
            .increment(emitted as u64);
        self.publish_gauges();
        tracing::debug!(
            offset,
            emitted,
            pending = self.checkpoint.pending_historical_offsets.len(),
            "Backfill page complete"
        );

        if self.config.await_batch_completion && emitted > 0 {
            self.set_phase(DiscoveryPhase::Downloading);
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = self.sink.wait_idle() => {}
            }
            self.set_phase(DiscoveryPhase::Discovering);
        }

        Ok(())
    }

    async fn extend(&mut self) -> Result<()> {
        match fetch_page(&self.gateway, ListQuery::count()).await {
            Ok(page) => {
                let added = self
                    .checkpoint
                    .extend_to(page.total_num_records, self.config.page_size);
                if !added.is_empty() {
                    self.save()?;
                    counter!("discovery_offsets_extended_total").increment(added.len() as u64);
                    self.publish_gauges();
                    tracing::info!(
                        total = page.total_num_records,
                        added = added.len(),
                        "Corpus grew, extended backfill"
                    );
                }
                Ok(())
            }
            Err(FetchError::Closed) => Err(Error::Upstream(FetchError::Closed)),
            Err(e) => {
                tracing::warn!(error = %e, "Could not check for new records");
                Ok(())
            }
        }
    }

    /// Charge a failed request to the budget. `Ok` means try again.
    fn absorb_failure(&mut self, error: FetchError) -> Result<()> {
        match error {
            FetchError::Transient(reason) => {
                tracing::warn!(%reason, "Listing request failed, retrying");
                self.budget.try_restart()?;
                Ok(())
            }
            // Only returned once shutdown has begun
            FetchError::RateLimited => Ok(()),
            e @ (FetchError::Permanent { .. }
            | FetchError::InvalidRequest(_)
            | FetchError::Closed) => Err(e.into()),
        }
    }

    fn save(&self) -> Result<()> {
        save_json(
            self.store.as_ref(),
            &self.config.checkpoint_key,
            &self.checkpoint,
        )
    }

    fn set_phase(&mut self, phase: DiscoveryPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Backfill phase change");
            self.phase = phase;
            gauge!("discovery_phase").set(phase.as_gauge());
        }
    }

    fn publish_gauges(&self) {
        gauge!("discovery_pending_offsets")
            .set(self.checkpoint.pending_historical_offsets.len() as f64);
        if let Some(total) = self.checkpoint.total_known_records {
            gauge!("discovery_total_known_records").set(total as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;
    use crate::gateway::{Gateway, GatewayConfig, UpstreamRequest, UpstreamResponse};
    use crate::testing::{ScriptedTransport, corpus_ids, corpus_page, reference_ids};
    use regvault_core::DocumentReference;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            await_batch_completion: false,
            ..Default::default()
        }
    }

    fn corpus(total: u64) -> ScriptedTransport {
        ScriptedTransport::new(move |request| match request {
            UpstreamRequest::ListDocuments(query) => Ok(corpus_page(total, query)),
            _ => Ok(UpstreamResponse::new(404, "")),
        })
    }

    fn page_offsets(transport: &ScriptedTransport) -> Vec<u64> {
        transport
            .list_queries()
            .iter()
            .filter(|q| q.results_per_page > 0)
            .map(|q| q.page_offset)
            .collect()
    }

    async fn collect(rx: &mut mpsc::Receiver<DocumentReference>, n: usize) -> Vec<DocumentReference> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            out.push(rx.recv().await.unwrap());
        }
        out
    }

    fn stored(store: &SqliteCheckpointStore) -> Checkpoint {
        load_json(store, "discovery.backfill.checkpoint")
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_backfill_walks_pages_newest_first() {
        let transport = corpus(2500);
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(4096);

        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());

        let references = collect(&mut rx, 2500).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let mut expected = corpus_ids(2000, 500);
        expected.extend(corpus_ids(1000, 1000));
        expected.extend(corpus_ids(0, 1000));
        assert_eq!(reference_ids(&references), expected);

        // First request only learns the total
        assert_eq!(transport.list_queries()[0].results_per_page, 0);
        assert_eq!(page_offsets(&transport), vec![2000, 1000, 0]);

        let checkpoint = stored(&store);
        assert_eq!(checkpoint.total_known_records, Some(2500));
        assert!(checkpoint.pending_historical_offsets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_completed_offsets() {
        let transport = corpus(3000);
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        save_json(
            store.as_ref(),
            "discovery.backfill.checkpoint",
            &Checkpoint {
                total_known_records: Some(3000),
                pending_historical_offsets: BTreeSet::from([0, 2000]),
            },
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(4096);

        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());
        collect(&mut rx, 2000).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(transport.list_queries()[0], ListQuery::backfill(1000, 2000));
        assert_eq!(page_offsets(&transport), vec![2000, 0]);
        assert!(stored(&store).is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_offset_is_retried_not_skipped() {
        let throttled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&throttled);
        let transport = ScriptedTransport::new(move |request| match request {
            UpstreamRequest::ListDocuments(query) => {
                if query.page_offset == 5000
                    && query.results_per_page > 0
                    && !flag.swap(true, Ordering::SeqCst)
                {
                    return Ok(UpstreamResponse::new(429, ""));
                }
                Ok(corpus_page(6000, query))
            }
            _ => Ok(UpstreamResponse::new(404, "")),
        });
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(8192);

        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());
        let references = collect(&mut rx, 6000).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            page_offsets(&transport),
            vec![5000, 5000, 4000, 3000, 2000, 1000, 0]
        );
        let unique: BTreeSet<String> = reference_ids(&references).into_iter().collect();
        assert_eq!(unique.len(), 6000);
        assert!(stored(&store).is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_page_before_total_waits_and_retries_same_offset() {
        let lagged = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lagged);
        let transport = ScriptedTransport::new(move |request| match request {
            UpstreamRequest::ListDocuments(query) => {
                if query.page_offset == 1000 && !flag.swap(true, Ordering::SeqCst) {
                    return Ok(UpstreamResponse::new(
                        200,
                        r#"{"documents":[],"totalNumRecords":1500}"#,
                    ));
                }
                Ok(corpus_page(1500, query))
            }
            _ => Ok(UpstreamResponse::new(404, "")),
        });
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(4096);

        let start = Instant::now();
        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());
        let first = collect(&mut rx, 500).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        collect(&mut rx, 1000).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(reference_ids(&first), corpus_ids(1000, 500));
        assert_eq!(page_offsets(&transport), vec![1000, 1000, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_picks_up_new_records() {
        let total = Arc::new(AtomicU64::new(2500));
        let current = Arc::clone(&total);
        let transport = ScriptedTransport::new(move |request| match request {
            UpstreamRequest::ListDocuments(query) => {
                Ok(corpus_page(current.load(Ordering::SeqCst), query))
            }
            _ => Ok(UpstreamResponse::new(404, "")),
        });
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(8192);

        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());
        collect(&mut rx, 2500).await;

        total.store(3500, Ordering::SeqCst);
        // Page 2000 again (now full) plus the new page 3000
        let grown = collect(&mut rx, 1500).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let mut expected = corpus_ids(3000, 500);
        expected.extend(corpus_ids(2000, 1000));
        assert_eq!(reference_ids(&grown), expected);

        let checkpoint = stored(&store);
        assert_eq!(checkpoint.total_known_records, Some(3500));
        assert!(checkpoint.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_parks_offset() {
        let transport = ScriptedTransport::new(|request| match request {
            UpstreamRequest::ListDocuments(query) if query.page_offset == 1000 && query.results_per_page > 0 => {
                Ok(UpstreamResponse::new(400, ""))
            }
            UpstreamRequest::ListDocuments(query) => Ok(corpus_page(2500, query)),
            _ => Ok(UpstreamResponse::new(404, "")),
        });
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(4096);

        let driver = BackfillDriver::new(config(), gateway, store.clone(), tx, shutdown.clone());
        let task = tokio::spawn(driver.run());
        collect(&mut rx, 1500).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(page_offsets(&transport), vec![2000, 1000, 0]);
        // Still pending, so a restart tries it again
        assert_eq!(
            stored(&store).pending_historical_offsets,
            BTreeSet::from([1000])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_budget() {
        let transport = ScriptedTransport::new(|_| Ok(UpstreamResponse::new(503, "")));
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, _rx) = mpsc::channel(16);

        let driver = BackfillDriver::new(config(), gateway, store, tx, shutdown);
        let err = driver.run().await.unwrap_err();

        assert!(matches!(err, Error::RestartBudgetExhausted { .. }));
        // One initial attempt plus ten restarts
        assert_eq!(transport.requests().len(), 11);
    }

    /// Sink whose idle signal is controlled by the test.
    struct GatedSink {
        tx: mpsc::Sender<DocumentReference>,
        idle: Arc<Notify>,
    }

    impl ReferenceSink for GatedSink {
        async fn accept(&self, reference: DocumentReference) -> Result<()> {
            self.tx.accept(reference).await
        }

        async fn wait_idle(&self) {
            self.idle.notified().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_batch_completion_between_pages() {
        let transport = corpus(2000);
        let shutdown = CancellationToken::new();
        let (gateway, _g) =
            Gateway::spawn(GatewayConfig::default(), transport.clone(), shutdown.clone());
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let (tx, mut rx) = mpsc::channel(4096);
        let idle = Arc::new(Notify::new());
        let sink = GatedSink {
            tx,
            idle: Arc::clone(&idle),
        };

        let config = DiscoveryConfig {
            await_batch_completion: true,
            ..Default::default()
        };
        let driver = BackfillDriver::new(config, gateway, store, sink, shutdown.clone());
        let task = tokio::spawn(driver.run());

        collect(&mut rx, 1000).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(page_offsets(&transport), vec![1000]);

        idle.notify_one();
        collect(&mut rx, 1000).await;
        assert_eq!(page_offsets(&transport), vec![1000, 0]);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_phase_gauge_values() {
        assert_eq!(DiscoveryPhase::Discovering.as_gauge(), 0.0);
        assert_eq!(DiscoveryPhase::Downloading.as_gauge(), 1.0);
    }
}
