//! Upstream request vocabulary and the transport seam.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use bytes::Bytes;
use thiserror::Error;

/// Query for one page of the documents listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Page size; zero asks only for the total.
    pub results_per_page: u64,
    /// Offset of the first record on the page.
    pub page_offset: u64,
    /// Sort by posted date, oldest first.
    pub sort_by_posted_date: bool,
    /// Restrict to documents modified in the last N days.
    pub days_since_modified: Option<u32>,
}

impl ListQuery {
    /// Zero-result query used only to learn the corpus size.
    pub fn count() -> Self {
        Self {
            results_per_page: 0,
            page_offset: 0,
            sort_by_posted_date: true,
            days_since_modified: None,
        }
    }

    /// One page of the full corpus in posted-date order.
    pub fn backfill(page_size: u64, page_offset: u64) -> Self {
        Self {
            results_per_page: page_size,
            page_offset,
            sort_by_posted_date: true,
            days_since_modified: None,
        }
    }

    /// One page of recently modified documents.
    pub fn recent(days: u32, page_size: u64, page_offset: u64) -> Self {
        Self {
            results_per_page: page_size,
            page_offset,
            sort_by_posted_date: false,
            days_since_modified: Some(days),
        }
    }
}

/// A request the gateway can dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRequest {
    /// One page of the documents listing.
    ListDocuments(ListQuery),
    /// Full body of one document.
    GetDocument { document_id: String },
    /// A binary download by format URL.
    Download { url: String },
}

impl fmt::Display for UpstreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListDocuments(query) => write!(
                f,
                "documents(rpp={}, po={})",
                query.results_per_page, query.page_offset
            ),
            Self::GetDocument { document_id } => write!(f, "document({document_id})"),
            Self::Download { url } => write!(f, "download({url})"),
        }
    }
}

/// A raw upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header, normalizing the name.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// The request never produced an HTTP response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be turned into an upstream call, e.g. a
    /// malformed download URL. Sending it again cannot help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection, timeout or body read failure.
    #[error("transport failure: {0}")]
    Network(String),
}

/// Sends one request upstream and returns whatever came back.
///
/// Implementations do not interpret status codes; that is the gateway's job.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &UpstreamRequest,
    ) -> impl Future<Output = Result<UpstreamResponse, TransportError>> + Send;
}
