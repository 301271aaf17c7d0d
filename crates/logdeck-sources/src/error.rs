use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by ingestion sources
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("address already in use: port {port}")]
    AddressInUse { port: u16 },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TCP server is already running on port {port}")]
    AlreadyRunning { port: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl SourceError {
    pub(crate) fn bind(address: String, port: u16, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddressInUse { port }
        } else {
            Self::Bind { address, source }
        }
    }
}
