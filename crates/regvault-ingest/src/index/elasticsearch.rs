//! Elasticsearch backend over its REST API.

use std::time::Duration;

use serde_json::{Value, json};

use super::{BulkItemResult, CreateIndexOutcome, IndexDocument, IndexSettings, SearchBackend};
use crate::{Error, Result};

/// Connection settings for Elasticsearch.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster URL, e.g. `http://localhost:9200`.
    pub url: String,
    /// Name of the ingest pipeline that extracts attachment text.
    pub pipeline: String,
    pub timeout: Duration,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            pipeline: "attachment".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ElasticsearchBackend {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchBackend {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        tracing::info!(url = %config.url, pipeline = %config.pipeline, "Elasticsearch backend configured");
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }
}

impl SearchBackend for ElasticsearchBackend {
    async fn ensure_pipeline(&self) -> Result<()> {
        let url = self.endpoint(&format!("_ingest/pipeline/{}", self.config.pipeline));
        let response = self.client.put(url).json(&pipeline_body()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Search(format!(
                "registering ingest pipeline failed with HTTP {}: {}",
                status, body
            )));
        }
        tracing::info!(pipeline = %self.config.pipeline, "Ingest pipeline registered");
        Ok(())
    }

    async fn create_index(&self, name: &str, settings: &IndexSettings) -> Result<CreateIndexOutcome> {
        let response = self
            .client
            .put(self.endpoint(name))
            .json(&settings_body(settings))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(CreateIndexOutcome::Created);
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        if error_type(&body["error"]) == Some("resource_already_exists_exception") {
            return Ok(CreateIndexOutcome::AlreadyExists);
        }
        Err(Error::Search(format!(
            "creating index {} failed with HTTP {}: {}",
            name, status, body
        )))
    }

    async fn bulk(&self, documents: &[IndexDocument]) -> Result<Vec<BulkItemResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint("_bulk"))
            .query(&[("pipeline", self.config.pipeline.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(documents)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Search(format!("bulk request failed with HTTP {}: {}", status, body)));
        }

        let body: Value = response.json().await?;
        Ok(parse_bulk_response(&body, documents))
    }
}

fn settings_body(settings: &IndexSettings) -> Value {
    json!({
        "settings": {
            "number_of_shards": settings.shards,
            "number_of_replicas": settings.replicas,
        }
    })
}

/// Extract text from the base64 `data` field, then drop the raw bytes.
fn pipeline_body() -> Value {
    json!({
        "description": "Extract attachment text",
        "processors": [
            {"attachment": {"field": "data", "indexed_chars": -1, "ignore_missing": true}},
            {"remove": {"field": "data", "ignore_missing": true}}
        ]
    })
}

/// NDJSON body of a bulk `index` request.
fn bulk_body(documents: &[IndexDocument]) -> Result<String> {
    let mut body = String::new();
    for document in documents {
        let action = json!({"index": {"_index": document.index, "_id": document.id}});
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&document.source)?);
        body.push('\n');
    }
    Ok(body)
}

/// One result per submitted document. Items missing from the response count
/// as failed.
fn parse_bulk_response(body: &Value, documents: &[IndexDocument]) -> Vec<BulkItemResult> {
    let items = body["items"].as_array().map(Vec::as_slice).unwrap_or_default();

    documents
        .iter()
        .enumerate()
        .map(|(i, document)| {
            let Some(item) = items.get(i).and_then(|item| item.get("index")) else {
                return BulkItemResult {
                    id: document.id.clone(),
                    error: Some("missing from bulk response".to_string()),
                };
            };
            let error = item.get("error").map(|e| match error_type(e) {
                Some(kind) => format!("{}: {}", kind, e["reason"].as_str().unwrap_or_default()),
                None => e.to_string(),
            });
            BulkItemResult {
                id: item["_id"].as_str().unwrap_or(&document.id).to_string(),
                error,
            }
        })
        .collect()
}

fn error_type(error: &Value) -> Option<&str> {
    error["type"].as_str()
}
