//! Prometheus metrics helpers for the regvault harvester.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across harvester components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use regvault_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("my_counter").increment(1);
//!     gauge!("my_gauge").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! All regvault metrics follow these conventions:
//! - Prefix: Component name (e.g., `gateway_`, `discovery_`, `index_`)
//! - Suffix: Unit or type (e.g., `_total`, `_bytes`, `_seconds`)
//! - Labels: Use sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    // Register all metric descriptions upfront
    register_common_metrics();

    handle
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port.
/// Binds the listener before returning, then serves from a background task.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9091)
/// * `handle` - Prometheus handle from [`init_metrics`]
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded across the harvester.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Process Metrics
    // =========================================================================

    describe_gauge!(
        "harvester_running",
        "Whether the harvester daemon is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Gateway Metrics
    // =========================================================================

    describe_counter!(
        "gateway_requests_total",
        "Upstream requests dispatched by the gateway (label: outcome)"
    );
    describe_counter!(
        "gateway_cooldowns_total",
        "Transitions into the cooling state (label: kind = soft|hard)"
    );
    describe_gauge!(
        "gateway_quota_remaining",
        "Remaining upstream quota reported by the last response"
    );
    describe_gauge!(
        "gateway_queue_depth",
        "Requests held in the gateway pending queue"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Time spent waiting on upstream responses"
    );

    // =========================================================================
    // Discovery Metrics
    // =========================================================================

    describe_counter!(
        "discovery_pages_fetched_total",
        "Listing pages fetched successfully (label: mode = recent|backfill)"
    );
    describe_counter!(
        "discovery_references_emitted_total",
        "Document references handed to the downloader (label: mode)"
    );
    describe_counter!(
        "discovery_upstream_lag_total",
        "Empty pages seen before the reported total was reached"
    );
    describe_counter!(
        "discovery_offsets_extended_total",
        "Offsets appended to the checkpoint because the corpus grew"
    );
    describe_gauge!(
        "discovery_pending_offsets",
        "Backfill page offsets not yet fetched"
    );
    describe_gauge!(
        "discovery_phase",
        "Backfill phase (0=discovering, 1=waiting for downloads)"
    );
    describe_gauge!(
        "discovery_total_known_records",
        "Total record count last reported by the upstream"
    );

    // =========================================================================
    // Download Metrics
    // =========================================================================

    describe_counter!(
        "download_items_emitted_total",
        "Content items emitted to storage and index (label: kind = json|file)"
    );
    describe_counter!(
        "download_bytes_total",
        "Bytes of content downloaded (label: type = json|file)"
    );
    describe_counter!(
        "download_documents_completed_total",
        "Documents whose every derived item has been emitted"
    );
    describe_counter!(
        "download_items_dropped_total",
        "Requests dropped after a permanent upstream failure"
    );
    describe_counter!(
        "download_worker_restarts_total",
        "Download worker restarts after a crash"
    );
    describe_gauge!(
        "download_in_progress",
        "Outstanding (document, tag) pairs in the downloader"
    );

    // =========================================================================
    // Persister Metrics
    // =========================================================================

    describe_counter!(
        "persist_objects_written_total",
        "Objects written to storage (label: op = create|update)"
    );
    describe_counter!(
        "persist_containers_created_total",
        "Per-document containers created in storage"
    );
    describe_counter!(
        "persist_failures_total",
        "Storage writes lost to a backend failure"
    );

    // =========================================================================
    // Indexer Metrics
    // =========================================================================

    describe_counter!(
        "index_documents_indexed_total",
        "Documents accepted by the search backend"
    );
    describe_counter!(
        "index_bulk_errors_total",
        "Per-document errors reported by bulk writes"
    );
    describe_counter!(
        "index_batch_retries_total",
        "Batches rescheduled after a failed bulk write"
    );
    describe_counter!(
        "index_partitions_created_total",
        "Partition indices created on first use"
    );
    describe_histogram!(
        "index_bulk_duration_seconds",
        "Time spent on bulk writes"
    );

    describe_counter!(
        "supervisor_restarts_total",
        "Component restarts granted by a restart budget (label: component)"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Record bytes metrics with a type label.
///
/// # Example
///
/// ```rust,ignore
/// use regvault_core::metrics::record_bytes;
///
/// record_bytes("download_bytes_total", "file", 1024);
/// record_bytes("download_bytes_total", "json", 512);
/// ```
pub fn record_bytes(metric_name: &'static str, byte_type: &'static str, bytes: u64) {
    metrics::counter!(metric_name, "type" => byte_type).increment(bytes);
}
