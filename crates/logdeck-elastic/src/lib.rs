//! Elasticsearch integration for logdeck
//!
//! - [`BulkIndexer`]: idempotent indexing with deterministic document ids,
//!   per-item classification and retry of throttled items
//! - [`ElasticForwarder`]: background sink that batches ingested entries
//!   into the indexer
//! - [`ElasticSource`]: query string search feeding hits through the
//!   normalizer

mod config;
mod error;
mod fingerprint;
mod forwarder;
mod indexer;
mod metrics;
mod retry;
mod source;

pub use config::ElasticConfig;
pub use error::ElasticError;
pub use fingerprint::document_id;
pub use forwarder::ElasticForwarder;
pub use indexer::{BulkIndexer, BulkReport, IndexOutcome, ItemFailure};
pub use metrics::{IndexMetrics, MetricsSnapshot};
pub use retry::{Backoff, is_retryable_status};
pub use source::ElasticSource;
