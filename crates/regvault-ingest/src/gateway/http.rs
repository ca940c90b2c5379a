//! `reqwest` transport for the regulations.gov v3 API.

use std::time::Duration;

use reqwest::Url;

use super::transport::{ListQuery, Transport, TransportError, UpstreamRequest, UpstreamResponse};
use crate::{Error, Result};

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// API root, e.g. `https://api.data.gov`.
    pub base_url: String,
    /// Key sent as the `api_key` query parameter on every request.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.data.gov".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(120),
            user_agent: concat!("regvault/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Production transport backed by a shared `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    /// Build the URL for a request, including the API key.
    pub fn url_for(&self, request: &UpstreamRequest) -> Result<Url> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = match request {
            UpstreamRequest::ListDocuments(query) => {
                let mut url = parse(&format!("{base}/regulations/v3/documents.json"))?;
                append_list_query(&mut url, query);
                url
            }
            UpstreamRequest::GetDocument { document_id } => {
                let mut url = parse(&format!("{base}/regulations/v3/document.json"))?;
                url.query_pairs_mut()
                    .append_pair("documentId", document_id);
                url
            }
            UpstreamRequest::Download { url } => parse(url)?,
        };

        url.query_pairs_mut()
            .append_pair("api_key", &self.config.api_key);
        Ok(url)
    }
}

fn parse(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("Invalid URL '{}': {}", raw, e)))
}

fn append_list_query(url: &mut Url, query: &ListQuery) {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("rpp", &query.results_per_page.to_string());
    pairs.append_pair("po", &query.page_offset.to_string());
    if query.sort_by_posted_date {
        pairs.append_pair("sb", "postedDate");
        pairs.append_pair("so", "ASC");
    }
    if let Some(days) = query.days_since_modified {
        pairs.append_pair("daysSinceModified", &days.to_string());
    }
}

/// The request URL carries the API key, so it never reaches the message.
fn network_error(error: reqwest::Error) -> TransportError {
    TransportError::Network(error.without_url().to_string())
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        let url = self
            .url_for(request)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(network_error)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            base_url: "https://api.example.gov/".to_string(),
            api_key: "KEY".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_backfill_url() {
        let url = transport()
            .url_for(&UpstreamRequest::ListDocuments(ListQuery::backfill(1000, 2000)))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.gov/regulations/v3/documents.json?rpp=1000&po=2000&sb=postedDate&so=ASC&api_key=KEY"
        );
    }

    #[test]
    fn test_recent_url() {
        let url = transport()
            .url_for(&UpstreamRequest::ListDocuments(ListQuery::recent(1, 1000, 0)))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.gov/regulations/v3/documents.json?rpp=1000&po=0&daysSinceModified=1&api_key=KEY"
        );
    }

    #[test]
    fn test_document_and_download_urls() {
        let t = transport();
        let url = t
            .url_for(&UpstreamRequest::GetDocument {
                document_id: "EPA-HQ-2017-0001".to_string(),
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.gov/regulations/v3/document.json?documentId=EPA-HQ-2017-0001&api_key=KEY"
        );

        let url = t
            .url_for(&UpstreamRequest::Download {
                url: "https://api.example.gov/regulations/v3/download?documentId=X&contentType=pdf"
                    .to_string(),
            })
            .unwrap();
        assert!(url.as_str().ends_with("contentType=pdf&api_key=KEY"));
    }

    #[test]
    fn test_invalid_download_url() {
        let result = transport().url_for(&UpstreamRequest::Download {
            url: "not a url".to_string(),
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_invalid() {
        let result = transport()
            .send(&UpstreamRequest::Download {
                url: "not a url".to_string(),
            })
            .await;
        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_network_error_omits_api_key() {
        let transport = HttpTransport::new(HttpTransportConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "SECRETKEY".to_string(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();

        let result = transport
            .send(&UpstreamRequest::GetDocument {
                document_id: "EPA-HQ-2017-0001".to_string(),
            })
            .await;

        match result {
            Err(TransportError::Network(message)) => {
                assert!(!message.contains("SECRETKEY"), "{message}");
                assert!(!message.contains("api_key"), "{message}");
            }
            other => panic!("expected a network failure, got {other:?}"),
        }
    }
}
