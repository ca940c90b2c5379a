//! Rate-limited request gateway.
//!
//! Every upstream call goes through one gateway per host. The gateway owns the
//! quota state for that host and decides when requests may leave.
//!
//! # States
//!
//! ```text
//!            quota header < threshold (soft)
//!            HTTP 429 (hard, request requeued at front)
//!   ┌──────┐ ─────────────────────────────────▶ ┌─────────┐
//!   │ Open │                                     │ Cooling │  queue, never reject
//!   └──────┘ ◀───────────────────────────────── └─────────┘
//!                     cooldown timer fires
//! ```
//!
//! Requests are dispatched one at a time in arrival order. While cooling,
//! new requests wait in the same FIFO queue and are released in order once
//! the timer fires.
//!
//! Status handling: 2xx is returned to the caller, 429 is requeued, other
//! 4xx is a [`FetchError::Permanent`], 5xx and network failures are a
//! [`FetchError::Transient`] the caller may resubmit. A request the transport
//! cannot even build is a [`FetchError::InvalidRequest`] and is never retried.

mod http;
mod transport;

pub use http::{HttpTransport, HttpTransportConfig};
pub use transport::{ListQuery, Transport, TransportError, UpstreamRequest, UpstreamResponse};

use std::collections::VecDeque;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Why a gateway request did not produce a usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The request was held back by quota pressure and the gateway stopped
    /// before it could be sent.
    #[error("request held by rate limiting at shutdown")]
    RateLimited,

    /// 5xx or network failure; resubmitting may succeed.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// 4xx other than 429; resubmitting will not help.
    #[error("permanent upstream failure: HTTP {status}")]
    Permanent { status: u16 },

    /// The request could not be built, so it was never sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The gateway task is gone.
    #[error("gateway closed")]
    Closed,
}

/// Configuration for the rate-limited gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Response header carrying the remaining request quota.
    pub quota_header: String,
    /// Cool down proactively once the remaining quota drops below this.
    pub soft_threshold: u64,
    /// Pause after the soft threshold is crossed.
    pub soft_cooldown: Duration,
    /// Pause after an HTTP 429.
    pub hard_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            quota_header: "X-RateLimit-Remaining".to_string(),
            soft_threshold: 5,
            soft_cooldown: Duration::from_secs(60),
            hard_cooldown: Duration::from_secs(300),
        }
    }
}

/// Observable quota state of a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Quota reported by the most recent response, if any carried the header.
    pub remaining_quota: Option<u64>,
    /// When the current cooldown ends; `None` while open.
    pub cooldown_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CooldownKind {
    Soft,
    Hard,
}

impl CooldownKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayState {
    Open,
    Cooling { until: Instant },
}

type Reply = oneshot::Sender<Result<UpstreamResponse, FetchError>>;

struct PendingRequest {
    request: UpstreamRequest,
    reply: Reply,
}

/// Cloneable handle for submitting requests to a gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<PendingRequest>,
    state: watch::Receiver<RateLimitState>,
}

impl GatewayHandle {
    /// Enqueue a request and return the receiver for its outcome.
    ///
    /// Enqueueing is synchronous, so requests submitted from one task keep
    /// their order.
    pub fn submit(
        &self,
        request: UpstreamRequest,
    ) -> Result<oneshot::Receiver<Result<UpstreamResponse, FetchError>>, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingRequest { request, reply })
            .map_err(|_| FetchError::Closed)?;
        Ok(rx)
    }

    /// Submit a request and wait for its outcome.
    pub async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, FetchError> {
        let rx = self.submit(request)?;
        rx.await.map_err(|_| FetchError::Closed)?
    }

    /// Snapshot of the current quota state.
    pub fn rate_limit_state(&self) -> RateLimitState {
        self.state.borrow().clone()
    }
}

/// The gateway actor. Construct with [`Gateway::spawn`].
pub struct Gateway<T: Transport> {
    config: GatewayConfig,
    transport: T,
    state: GatewayState,
    pending: VecDeque<PendingRequest>,
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    rx_closed: bool,
    state_tx: watch::Sender<RateLimitState>,
    shutdown: CancellationToken,
}

impl<T: Transport> Gateway<T> {
    /// Start a gateway task.
    ///
    /// The task runs until every handle has been dropped and the queue is
    /// empty. Once `shutdown` fires the gateway stops honoring cooldowns:
    /// queued requests held by quota pressure are answered with
    /// [`FetchError::RateLimited`] and later 429s are answered the same way.
    pub fn spawn(
        config: GatewayConfig,
        transport: T,
        shutdown: CancellationToken,
    ) -> (GatewayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RateLimitState::default());

        let gateway = Self {
            config,
            transport,
            state: GatewayState::Open,
            pending: VecDeque::new(),
            rx,
            rx_closed: false,
            state_tx,
            shutdown,
        };
        let task = tokio::spawn(gateway.run());

        (
            GatewayHandle {
                tx,
                state: state_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        tracing::debug!("Gateway started");

        loop {
            match self.state {
                GatewayState::Open => {
                    if let Some(next) = self.pending.pop_front() {
                        self.set_queue_gauge();
                        self.dispatch(next).await;
                        continue;
                    }
                    if self.rx_closed {
                        break;
                    }
                    match self.rx.recv().await {
                        Some(request) => self.enqueue(request),
                        None => self.rx_closed = true,
                    }
                }
                GatewayState::Cooling { until } => {
                    // Timers first so a busy channel cannot hold the gateway shut
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.release_held();
                            self.open();
                        }
                        _ = sleep_until(until) => self.open(),
                        request = self.rx.recv(), if !self.rx_closed => match request {
                            Some(request) => self.enqueue(request),
                            None => self.rx_closed = true,
                        },
                    }
                }
            }
        }

        tracing::debug!("Gateway stopped");
    }

    fn enqueue(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
        self.set_queue_gauge();
    }

    async fn dispatch(&mut self, pending: PendingRequest) {
        let started = Instant::now();
        let result = self.transport.send(&pending.request).await;
        histogram!("gateway_request_duration_seconds").record(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(TransportError::InvalidRequest(reason)) => {
                counter!("gateway_requests_total", "outcome" => "invalid").increment(1);
                tracing::warn!(request = %pending.request, %reason, "Request cannot be sent");
                let _ = pending.reply.send(Err(FetchError::InvalidRequest(reason)));
                return;
            }
            Err(TransportError::Network(reason)) => {
                counter!("gateway_requests_total", "outcome" => "transient").increment(1);
                tracing::warn!(request = %pending.request, %reason, "Upstream request failed");
                let _ = pending.reply.send(Err(FetchError::Transient(reason)));
                return;
            }
        };

        let remaining = self.observe_quota(&response);

        match response.status {
            429 => {
                counter!("gateway_requests_total", "outcome" => "rate_limited").increment(1);
                if self.shutdown.is_cancelled() {
                    let _ = pending.reply.send(Err(FetchError::RateLimited));
                    return;
                }
                tracing::warn!(
                    request = %pending.request,
                    cooldown = ?self.config.hard_cooldown,
                    "Rate limited by upstream, requeueing"
                );
                self.pending.push_front(pending);
                self.set_queue_gauge();
                self.cool(self.config.hard_cooldown, CooldownKind::Hard);
                return;
            }
            status @ 200..=299 => {
                counter!("gateway_requests_total", "outcome" => "success").increment(1);
                tracing::debug!(request = %pending.request, status, "Upstream request succeeded");
                let _ = pending.reply.send(Ok(response));
            }
            status @ 400..=499 => {
                counter!("gateway_requests_total", "outcome" => "permanent").increment(1);
                tracing::warn!(request = %pending.request, status, "Upstream rejected request");
                let _ = pending.reply.send(Err(FetchError::Permanent { status }));
            }
            status => {
                counter!("gateway_requests_total", "outcome" => "transient").increment(1);
                tracing::warn!(request = %pending.request, status, "Upstream server error");
                let _ = pending
                    .reply
                    .send(Err(FetchError::Transient(format!("HTTP {status}"))));
            }
        }

        if let Some(remaining) = remaining
            && remaining < self.config.soft_threshold
            && self.state == GatewayState::Open
            && !self.shutdown.is_cancelled()
        {
            tracing::info!(
                remaining,
                threshold = self.config.soft_threshold,
                "Quota running low, cooling down"
            );
            self.cool(self.config.soft_cooldown, CooldownKind::Soft);
        }
    }

    fn observe_quota(&mut self, response: &UpstreamResponse) -> Option<u64> {
        let remaining = response
            .header(&self.config.quota_header)
            .and_then(|v| v.trim().parse::<u64>().ok())?;

        gauge!("gateway_quota_remaining").set(remaining as f64);
        self.state_tx
            .send_modify(|state| state.remaining_quota = Some(remaining));
        Some(remaining)
    }

    fn cool(&mut self, duration: Duration, kind: CooldownKind) {
        let until = Instant::now() + duration;
        self.state = GatewayState::Cooling { until };
        self.state_tx
            .send_modify(|state| state.cooldown_until = Some(until));
        counter!("gateway_cooldowns_total", "kind" => kind.as_str()).increment(1);
        tracing::info!(kind = kind.as_str(), ?duration, "Gateway cooling");
    }

    fn open(&mut self) {
        self.state = GatewayState::Open;
        self.state_tx
            .send_modify(|state| state.cooldown_until = None);
        tracing::info!(queued = self.pending.len(), "Gateway open, releasing queue");
    }

    fn release_held(&mut self) {
        let held = self.pending.len();
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(FetchError::RateLimited));
        }
        self.set_queue_gauge();
        if held > 0 {
            tracing::info!(held, "Shutdown during cooldown, released held requests");
        }
    }

    fn set_queue_gauge(&self) {
        gauge!("gateway_queue_depth").set(self.pending.len() as f64);
    }
}
