use std::time::Duration;

use serde::Deserialize;

/// Elasticsearch connection, indexing and search settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// Forward every ingested entry to Elasticsearch
    pub enabled: bool,

    pub base_url: String,
    pub index: String,

    /// Documents per `_bulk` request
    pub bulk_size: usize,

    /// Resubmissions of a retryable document before it counts as failed
    pub max_retries: u32,

    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,

    pub timeout_ms: u64,

    /// Forwarder flushes at least this often
    pub flush_interval_ms: u64,

    /// Entries queued for the forwarder before new ones are dropped
    pub queue_capacity: usize,

    /// Query run once at startup, results are ingested like any other source
    pub query: Option<String>,

    pub search_size: usize,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:9200".to_string(),
            index: "logdeck".to_string(),
            bulk_size: 500,
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
            jitter: true,
            timeout_ms: 30_000,
            flush_interval_ms: 1000,
            queue_capacity: 10_000,
            query: None,
            search_size: 500,
        }
    }
}

impl ElasticConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
