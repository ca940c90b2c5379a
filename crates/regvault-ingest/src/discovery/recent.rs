//! Periodic poll of recently modified documents.

use metrics::counter;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{DiscoveryConfig, ReferenceSink, fetch_page};
use crate::gateway::{FetchError, GatewayHandle, ListQuery};
use crate::supervisor::RestartBudget;
use crate::Result;

/// Re-walks "modified in the last N days" from offset 0 on every cycle.
pub struct RecentPoller<K: ReferenceSink> {
    config: DiscoveryConfig,
    gateway: GatewayHandle,
    sink: K,
    budget: RestartBudget,
    shutdown: CancellationToken,
}

impl<K: ReferenceSink> RecentPoller<K> {
    pub fn new(
        config: DiscoveryConfig,
        gateway: GatewayHandle,
        sink: K,
        shutdown: CancellationToken,
    ) -> Self {
        let budget = RestartBudget::new("recent", config.restart_policy);
        Self {
            config,
            gateway,
            sink,
            budget,
            shutdown,
        }
    }

    /// Poll immediately, then once per interval until shutdown.
    pub async fn run(mut self) -> Result<()> {
        while !self.shutdown.is_cancelled() {
            let emitted = self.poll_cycle().await?;
            tracing::info!(
                emitted,
                days = self.config.recent_days,
                next_in = ?self.config.recent_interval,
                "Recent documents cycle complete"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.recent_interval) => {}
            }
        }

        tracing::info!("Recent poller stopped");
        Ok(())
    }

    /// Walk every page of the recent window once. Returns the number of
    /// references emitted.
    pub async fn poll_cycle(&mut self) -> Result<usize> {
        let page_size = self.config.page_size;
        let mut offset = 0u64;
        let mut emitted = 0usize;

        while !self.shutdown.is_cancelled() {
            let query = ListQuery::recent(self.config.recent_days, page_size, offset);
            let page = match fetch_page(&self.gateway, query).await {
                Ok(page) => page,
                Err(FetchError::Transient(reason)) => {
                    tracing::warn!(offset, %reason, "Recent page failed, retrying");
                    self.budget.try_restart()?;
                    continue;
                }
                Err(FetchError::Permanent { status }) => {
                    tracing::error!(offset, status, "Recent page rejected, abandoning cycle");
                    break;
                }
                Err(FetchError::InvalidRequest(reason)) => {
                    tracing::error!(offset, %reason, "Recent page request invalid, abandoning cycle");
                    break;
                }
                Err(FetchError::RateLimited) => break,
                Err(e @ FetchError::Closed) => return Err(e.into()),
            };

            let count = page.documents.len() as u64;
            if count == 0 && offset < page.total_num_records {
                counter!("discovery_upstream_lag_total").increment(1);
                tracing::info!(offset, total = page.total_num_records, "Empty recent page, waiting for upstream");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(self.config.lag_retry_interval) => continue,
                }
            }

            for reference in page.documents {
                self.sink.accept(reference).await?;
            }
            emitted += count as usize;
            counter!("discovery_pages_fetched_total", "mode" => "recent").increment(1);
            counter!("discovery_references_emitted_total", "mode" => "recent").increment(count);

            offset += count;
            if count < page_size || offset >= page.total_num_records {
                break;
            }
        }

        Ok(emitted)
    }
}
