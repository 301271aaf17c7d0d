use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElasticError {
    #[error("invalid Elasticsearch URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Elasticsearch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Elasticsearch returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gave up on document {id} after {attempts} attempts: {reason}")]
    RetriesExhausted { id: String, attempts: u32, reason: String },

    #[error("document {id} rejected: {reason}")]
    Rejected { id: String, reason: String },

    #[error("malformed Elasticsearch response: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
