//! Idempotent bulk indexing into Elasticsearch.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde_json::{Value, json};

use logdeck_types::LogEntry;

use crate::config::ElasticConfig;
use crate::error::ElasticError;
use crate::fingerprint::document_id;
use crate::metrics::IndexMetrics;
use crate::retry::{Backoff, is_retryable_status};

/// Result of indexing a single document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub id: String,
    /// The document already existed
    pub duplicate: bool,
}

/// A document that could not be indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Per-call bulk indexing summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub created: u64,
    pub duplicates: u64,
    /// Item resubmissions
    pub retries: u64,
    pub failed: u64,
    pub failures: Vec<ItemFailure>,
}

impl BulkReport {
    pub fn total(&self) -> u64 {
        self.created + self.duplicates + self.failed
    }
}

/// Classification of one bulk item response
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Created,
    Duplicate,
    Retryable(String),
    Fatal(String),
}

impl ItemOutcome {
    fn from_status(status: u16, reason: impl FnOnce() -> String) -> Self {
        match status {
            200 | 201 => Self::Created,
            409 => Self::Duplicate,
            s if is_retryable_status(s) => Self::Retryable(format!("status {s}: {}", reason())),
            s => Self::Fatal(format!("status {s}: {}", reason())),
        }
    }
}

struct Document {
    id: String,
    body: Value,
}

impl Document {
    fn new(entry: &LogEntry) -> Result<Self, ElasticError> {
        let mut body = serde_json::to_value(entry)?;
        if let (Value::Object(map), Some(ts)) = (&mut body, &entry.timestamp) {
            map.insert("@timestamp".to_string(), Value::String(ts.clone()));
        }
        Ok(Self {
            id: document_id(entry),
            body,
        })
    }
}

/// Writes entries to one index with deterministic ids
pub struct BulkIndexer {
    client: Client,
    config: ElasticConfig,
    backoff: Backoff,
    metrics: Arc<IndexMetrics>,
}

impl BulkIndexer {
    pub fn new(config: ElasticConfig) -> Result<Self, ElasticError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: ElasticConfig) -> Result<Self, ElasticError> {
        validate_base_url(&config.base_url)?;
        let backoff = Backoff::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.jitter,
        );
        Ok(Self {
            client,
            config,
            backoff,
            metrics: Arc::new(IndexMetrics::new()),
        })
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<IndexMetrics> {
        &self.metrics
    }

    /// Create one document unless it already exists.
    ///
    /// A conflict is a success with `duplicate: true`. Throttling and server
    /// errors are retried with backoff up to `max_retries`.
    pub async fn index_one(&self, entry: &LogEntry) -> Result<IndexOutcome, ElasticError> {
        let document = Document::new(entry)?;
        let url = format!(
            "{}/{}/_doc/{}?op_type=create",
            self.config.base(),
            self.config.index,
            document.id
        );

        let mut attempt = 0;
        loop {
            let outcome = match self.client.put(&url).json(&document.body).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    ItemOutcome::from_status(status, || body)
                }
                Err(e) => ItemOutcome::Retryable(e.to_string()),
            };

            match outcome {
                ItemOutcome::Created => {
                    self.metrics.record_created(1);
                    return Ok(IndexOutcome {
                        id: document.id,
                        duplicate: false,
                    });
                }
                ItemOutcome::Duplicate => {
                    self.metrics.record_duplicates(1);
                    return Ok(IndexOutcome {
                        id: document.id,
                        duplicate: true,
                    });
                }
                ItemOutcome::Retryable(reason) if attempt < self.config.max_retries => {
                    attempt += 1;
                    self.metrics.record_retries(1);
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(id = %document.id, attempt, ?delay, %reason, "Retrying document");
                    tokio::time::sleep(delay).await;
                }
                ItemOutcome::Retryable(reason) => {
                    self.metrics.record_failed(1);
                    return Err(ElasticError::RetriesExhausted {
                        id: document.id,
                        attempts: attempt + 1,
                        reason,
                    });
                }
                ItemOutcome::Fatal(reason) => {
                    self.metrics.record_failed(1);
                    return Err(ElasticError::Rejected {
                        id: document.id,
                        reason,
                    });
                }
            }
        }
    }

    /// Index entries in `bulk_size` chunks.
    ///
    /// Items are classified individually; retryable ones are resubmitted with
    /// backoff and the rest of the chunk is never held back by them.
    pub async fn index_bulk(&self, entries: &[LogEntry]) -> BulkReport {
        let mut report = BulkReport::default();

        for chunk in entries.chunks(self.config.bulk_size.max(1)) {
            let mut pending = Vec::with_capacity(chunk.len());
            for entry in chunk {
                match Document::new(entry) {
                    Ok(document) => pending.push(document),
                    Err(e) => {
                        report.failed += 1;
                        report.failures.push(ItemFailure {
                            id: document_id(entry),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            let mut attempt = 0;
            while !pending.is_empty() {
                let outcomes = self.submit(&pending).await;
                let mut retry = Vec::new();

                for (document, outcome) in pending.into_iter().zip(outcomes) {
                    match outcome {
                        ItemOutcome::Created => report.created += 1,
                        ItemOutcome::Duplicate => report.duplicates += 1,
                        ItemOutcome::Retryable(reason) => retry.push((document, reason)),
                        ItemOutcome::Fatal(reason) => {
                            report.failed += 1;
                            report.failures.push(ItemFailure {
                                id: document.id,
                                reason,
                            });
                        }
                    }
                }

                if retry.is_empty() {
                    break;
                }
                if attempt >= self.config.max_retries {
                    tracing::warn!(count = retry.len(), attempts = attempt + 1, "Giving up on bulk items");
                    report.failed += retry.len() as u64;
                    report
                        .failures
                        .extend(retry.into_iter().map(|(document, reason)| ItemFailure {
                            id: document.id,
                            reason,
                        }));
                    break;
                }

                attempt += 1;
                report.retries += retry.len() as u64;
                let delay = self.backoff.delay(attempt);
                tracing::debug!(count = retry.len(), attempt, ?delay, "Retrying bulk items");
                tokio::time::sleep(delay).await;
                pending = retry.into_iter().map(|(document, _)| document).collect();
            }
        }

        self.metrics.record_created(report.created);
        self.metrics.record_duplicates(report.duplicates);
        self.metrics.record_retries(report.retries);
        self.metrics.record_failed(report.failed);

        tracing::debug!(
            created = report.created,
            duplicates = report.duplicates,
            retries = report.retries,
            failed = report.failed,
            "Bulk indexing finished"
        );
        report
    }

    /// Send one `_bulk` request; returns one outcome per document
    async fn submit(&self, documents: &[Document]) -> Vec<ItemOutcome> {
        let body = self.bulk_body(documents);
        let url = format!("{}/_bulk", self.config.base());

        let response = match self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return all(documents, ItemOutcome::Retryable(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let outcome = ItemOutcome::from_status(status.as_u16(), || text);
            return all(documents, outcome);
        }

        match response.json::<Value>().await {
            Ok(parsed) => classify_items(&parsed, documents.len()),
            Err(e) => all(documents, ItemOutcome::Retryable(format!("unreadable bulk response: {e}"))),
        }
    }

    fn bulk_body(&self, documents: &[Document]) -> String {
        let mut body = String::new();
        for document in documents {
            let action = json!({ "create": { "_index": self.config.index, "_id": document.id } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&document.body.to_string());
            body.push('\n');
        }
        body
    }
}

fn all(documents: &[Document], outcome: ItemOutcome) -> Vec<ItemOutcome> {
    vec![outcome; documents.len()]
}

/// Map the `items` array of a bulk response onto the submitted documents
fn classify_items(response: &Value, expected: usize) -> Vec<ItemOutcome> {
    let items = response.get("items").and_then(Value::as_array);

    (0..expected)
        .map(|i| {
            let Some(result) = items
                .and_then(|items| items.get(i))
                .and_then(Value::as_object)
                .and_then(|item| item.values().next())
            else {
                return ItemOutcome::Retryable("missing item in bulk response".to_string());
            };

            let status = result
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            ItemOutcome::from_status(status, || {
                result
                    .pointer("/error/reason")
                    .and_then(Value::as_str)
                    .or_else(|| result.pointer("/error/type").and_then(Value::as_str))
                    .unwrap_or("no reason given")
                    .to_string()
            })
        })
        .collect()
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<Url, ElasticError> {
    let url = Url::parse(base_url).map_err(|e| ElasticError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ElasticError::InvalidUrl {
            url: base_url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
