use reqwest::Client;
use serde_json::{Value, json};

use logdeck_sources::Normalizer;
use logdeck_types::LogEntry;

use crate::config::ElasticConfig;
use crate::error::ElasticError;
use crate::indexer::validate_base_url;

/// Reads entries back out of an index with a query string search
pub struct ElasticSource {
    client: Client,
    config: ElasticConfig,
}

impl ElasticSource {
    pub fn new(config: ElasticConfig) -> Result<Self, ElasticError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: ElasticConfig) -> Result<Self, ElasticError> {
        validate_base_url(&config.base_url)?;
        Ok(Self { client, config })
    }

    /// Source label attached to every hit
    pub fn source_name(&self) -> String {
        format!("elastic:{}", self.config.index)
    }

    /// Newest `size` hits matching `query`, newest first
    pub async fn search(&self, query: &str, size: usize) -> Result<Vec<LogEntry>, ElasticError> {
        let query = if query.trim().is_empty() { "*" } else { query };
        let url = format!("{}/{}/_search", self.config.base(), self.config.index);
        let body = json!({
            "size": size,
            "query": { "query_string": { "query": query } },
            "sort": [ { "@timestamp": { "order": "desc", "unmapped_type": "date" } } ]
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ElasticError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: Value = response.json().await?;
        let hits = match parsed.pointer_mut("/hits/hits").map(Value::take) {
            Some(Value::Array(hits)) => hits,
            _ => return Err(ElasticError::Malformed("search response has no hits.hits array".to_string())),
        };

        let source = self.source_name();
        tracing::debug!(index = %self.config.index, query, hits = hits.len(), "Search finished");
        Ok(hits
            .into_iter()
            .map(|hit| Normalizer::from_elastic_hit(hit, &source))
            .collect())
    }
}
