//! Wiring of the harvesting components.
//!
//! ```text
//! [RecentPoller] ─┐
//!                 ├─▶ [DownloadCoordinator] ─▶ ContentFanout ─┬─▶ [Persister] ─▶ ObjectStore
//! [BackfillDriver]┘            │                              └─▶ [Indexer]   ─▶ SearchBackend
//!                              ▼
//!                         [Gateway] ─▶ Transport
//! ```
//!
//! # Shutdown
//!
//! Cancelling the token stops discovery. Each stage exits once its input
//! closes, so the drop of the last upstream handle drains the stages in
//! dependency order: discovery, downloads, then storage and indexing. A fatal
//! error in any stage cancels the token as well and is returned once every
//! stage has stopped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::HarvestConfig;
use crate::discovery::{BackfillDriver, RecentPoller};
use crate::download::{ContentFanout, DownloadCoordinator};
use crate::gateway::{Gateway, Transport};
use crate::index::{Indexer, SearchBackend};
use crate::persist::{ObjectStore, Persister};
use crate::{Error, Result};

/// Capacity of each channel feeding storage and indexing.
const CONTENT_CHANNEL_CAPACITY: usize = 256;

/// A fully configured harvester, ready to run.
pub struct Harvester<T, S, B> {
    config: HarvestConfig,
    transport: T,
    store: S,
    backend: B,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl<T, S, B> Harvester<T, S, B>
where
    T: Transport,
    S: ObjectStore,
    B: SearchBackend,
{
    pub fn new(
        config: HarvestConfig,
        transport: T,
        store: S,
        backend: B,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            backend,
            checkpoints,
        }
    }

    /// Run every component until `shutdown` fires or one of them fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            transport,
            store,
            backend,
            checkpoints,
        } = self;

        let mut stages: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        let (gateway, gateway_task) =
            Gateway::spawn(config.gateway.clone(), transport, shutdown.clone());

        let (persist_tx, persist_rx) = mpsc::channel(CONTENT_CHANNEL_CAPACITY);
        let (index_tx, index_rx) = mpsc::channel(CONTENT_CHANNEL_CAPACITY);

        let persister = Persister::new(config.persist.clone(), store).spawn(persist_rx);
        stages.spawn(flatten("persister", persister));

        let indexer = Indexer::new(config.indexer.clone(), backend).spawn(index_rx);
        stages.spawn(flatten("indexer", indexer));

        let (downloads, download_task) = DownloadCoordinator::spawn(
            config.download.clone(),
            gateway.clone(),
            ContentFanout::new(vec![persist_tx, index_tx]),
        );
        stages.spawn(flatten("downloads", download_task));

        if config.run_recent {
            let poller = RecentPoller::new(
                config.discovery.clone(),
                gateway.clone(),
                downloads.clone(),
                shutdown.clone(),
            );
            stages.spawn(async move { ("recent", poller.run().await) });
        }

        if config.run_backfill {
            let driver = BackfillDriver::new(
                config.discovery.clone(),
                gateway.clone(),
                checkpoints,
                downloads.clone(),
                shutdown.clone(),
            );
            stages.spawn(async move { ("backfill", driver.run().await) });
        }

        // Discovery now owns the only handles
        drop(downloads);
        drop(gateway);

        tracing::info!(
            recent = config.run_recent,
            backfill = config.run_backfill,
            "Harvester started"
        );

        let mut first_error: Option<Error> = None;
        while let Some(joined) = stages.join_next().await {
            let (stage, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => ("stage", Err(Error::Task(e.to_string()))),
            };

            match result {
                Ok(()) => tracing::info!(stage, "Stage stopped"),
                Err(e) => {
                    tracing::error!(stage, error = %e, "Stage failed, shutting down");
                    shutdown.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = gateway_task.await {
            tracing::error!(error = %e, "Gateway task failed");
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Harvester stopped");
                Ok(())
            }
        }
    }
}

async fn flatten(
    stage: &'static str,
    task: tokio::task::JoinHandle<Result<()>>,
) -> (&'static str, Result<()>) {
    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(Error::Task(format!("{stage}: {e}"))),
    };
    (stage, result)
}
