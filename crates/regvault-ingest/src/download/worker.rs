//! Single-flight download worker.
//!
//! A worker runs one request at a time. Requests that arrive while it is busy
//! wait in its pending queue in arrival order. Each request runs in its own
//! task so that a panic is contained and shows up as a crash of the worker.

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use regvault_core::metrics::record_bytes;
use regvault_core::{
    ContentItem, ContentTag, DocumentBody, FileRequest, filename_from_content_disposition,
};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use super::tracker::InProgress;
use super::{ContentFanout, DownloadRequest};
use crate::gateway::{FetchError, GatewayHandle, UpstreamRequest};
use crate::supervisor::{RestartBudget, RestartPolicy};
use crate::{Error, Result};

/// How one request ended, other than successfully.
#[derive(Debug)]
enum StepError {
    /// The worker crashed; the request is resubmitted after a restart.
    Crash(String),
    /// The request can never succeed and is dropped.
    Discard(FetchError),
    /// Nothing downstream can make progress.
    Fatal(Error),
}

type StepResult = std::result::Result<Vec<FileRequest>, StepError>;

struct InFlight {
    request: DownloadRequest,
    task: JoinHandle<StepResult>,
}

enum Event {
    Mail(Option<DownloadRequest>),
    Done(std::result::Result<StepResult, JoinError>),
}

pub(super) struct Worker {
    id: usize,
    gateway: GatewayHandle,
    fanout: ContentFanout,
    tracker: Arc<InProgress>,
    mailbox: mpsc::UnboundedReceiver<DownloadRequest>,
    pending: VecDeque<DownloadRequest>,
    budget: RestartBudget,
}

impl Worker {
    pub(super) fn new(
        id: usize,
        gateway: GatewayHandle,
        fanout: ContentFanout,
        tracker: Arc<InProgress>,
        mailbox: mpsc::UnboundedReceiver<DownloadRequest>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            id,
            gateway,
            fanout,
            tracker,
            mailbox,
            pending: VecDeque::new(),
            budget: RestartBudget::new(format!("download-worker-{id}"), policy),
        }
    }

    /// Process requests until the mailbox closes and the queue is drained.
    pub(super) async fn run(mut self) -> Result<()> {
        let mut mailbox_open = true;
        let mut in_flight: Option<InFlight> = None;

        loop {
            if in_flight.is_none() {
                if let Some(next) = self.pending.pop_front() {
                    in_flight = Some(self.start(next));
                    continue;
                }
                if !mailbox_open {
                    break;
                }
            }

            let event = match in_flight.as_mut() {
                Some(flight) => tokio::select! {
                    biased;
                    joined = &mut flight.task => Event::Done(joined),
                    mail = self.mailbox.recv(), if mailbox_open => Event::Mail(mail),
                },
                None => Event::Mail(self.mailbox.recv().await),
            };

            match event {
                Event::Mail(Some(request)) => self.pending.push_back(request),
                Event::Mail(None) => mailbox_open = false,
                Event::Done(joined) => {
                    if let Some(flight) = in_flight.take() {
                        self.finish(flight.request, joined)?;
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "Download worker stopped");
        Ok(())
    }

    fn start(&self, request: DownloadRequest) -> InFlight {
        let task = tokio::spawn(execute(
            self.gateway.clone(),
            self.fanout.clone(),
            request.clone(),
        ));
        InFlight { request, task }
    }

    fn finish(
        &mut self,
        request: DownloadRequest,
        joined: std::result::Result<StepResult, JoinError>,
    ) -> Result<()> {
        match joined {
            Ok(Ok(files)) => {
                // Register derived work before completing the parent so the
                // in-progress set never empties early.
                for file in files {
                    if self.tracker.register(&file.document_id, file.tag) {
                        self.pending.push_back(DownloadRequest::File(file));
                    }
                }
                self.complete(&request);
                Ok(())
            }
            Ok(Err(StepError::Discard(reason))) => {
                counter!("download_items_dropped_total").increment(1);
                tracing::warn!(
                    worker = self.id,
                    document_id = request.document_id(),
                    tag = %request.tag(),
                    url = request.url().unwrap_or_default(),
                    %reason,
                    "Dropping download"
                );
                self.complete(&request);
                Ok(())
            }
            Ok(Err(StepError::Crash(reason))) => self.restart(request, &reason),
            Ok(Err(StepError::Fatal(e))) => Err(e),
            Err(e) if e.is_panic() => self.restart(request, "panicked"),
            Err(e) => Err(Error::Task(e.to_string())),
        }
    }

    fn restart(&mut self, request: DownloadRequest, reason: &str) -> Result<()> {
        tracing::warn!(
            worker = self.id,
            document_id = request.document_id(),
            tag = %request.tag(),
            reason,
            "Download worker crashed"
        );
        let attempt = self.budget.try_restart()?;
        counter!("download_worker_restarts_total").increment(1);
        tracing::info!(
            worker = self.id,
            attempt,
            document_id = request.document_id(),
            tag = %request.tag(),
            "Restarted download worker, resubmitting request"
        );
        self.pending.push_front(request);
        Ok(())
    }

    fn complete(&self, request: &DownloadRequest) {
        if self.tracker.complete(request.document_id(), request.tag()) {
            counter!("download_documents_completed_total").increment(1);
            tracing::debug!(document_id = request.document_id(), "Document fully downloaded");
        }
    }
}

/// Run one request against the gateway and emit its content.
async fn execute(gateway: GatewayHandle, fanout: ContentFanout, request: DownloadRequest) -> StepResult {
    match request {
        DownloadRequest::Document(reference) => {
            let upstream = UpstreamRequest::GetDocument {
                document_id: reference.document_id.clone(),
            };
            let response = gateway.execute(upstream).await.map_err(classify)?;
            let body = DocumentBody::from_slice(&reference.document_id, &response.body)
                .map_err(|e| StepError::Crash(format!("undecodable document body: {e}")))?;

            let reference_item =
                ContentItem::json(&reference.document_id, ContentTag::Reference, &reference, None)
                    .map_err(|e| StepError::Fatal(e.into()))?;
            let document_item = ContentItem {
                document_id: reference.document_id.clone(),
                tag: ContentTag::Document,
                data: response.body.clone(),
                content_type: Some("application/json".to_string()),
                original_filename: Some("document.json".to_string()),
                source_url: None,
                retrieved_at: chrono::Utc::now(),
            };

            emit(&fanout, reference_item, "json").await?;
            emit(&fanout, document_item, "json").await?;
            Ok(body.file_requests())
        }
        DownloadRequest::File(file) => {
            let upstream = UpstreamRequest::Download {
                url: file.url.clone(),
            };
            let response = gateway.execute(upstream).await.map_err(classify)?;

            let item = ContentItem {
                document_id: file.document_id,
                tag: file.tag,
                content_type: response.header("content-type").map(str::to_string),
                original_filename: response
                    .header("content-disposition")
                    .and_then(filename_from_content_disposition),
                data: response.body,
                source_url: Some(file.url),
                retrieved_at: chrono::Utc::now(),
            };
            emit(&fanout, item, "file").await?;
            Ok(Vec::new())
        }
    }
}

fn classify(error: FetchError) -> StepError {
    match error {
        FetchError::Transient(reason) => StepError::Crash(reason),
        FetchError::Permanent { .. } | FetchError::InvalidRequest(_) | FetchError::RateLimited => {
            StepError::Discard(error)
        }
        FetchError::Closed => StepError::Fatal(Error::Upstream(error)),
    }
}

async fn emit(fanout: &ContentFanout, item: ContentItem, kind: &'static str) -> std::result::Result<(), StepError> {
    let bytes = item.data.len() as u64;
    fanout.emit(item).await.map_err(StepError::Fatal)?;
    record_bytes("download_bytes_total", kind, bytes);
    counter!("download_items_emitted_total", "kind" => kind).increment(1);
    Ok(())
}
