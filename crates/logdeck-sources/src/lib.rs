//! Log ingestion sources for logdeck
//!
//! This crate provides:
//! - The normalizer turning raw lines, HTTP bodies and Elasticsearch hits into entries
//! - A newline-delimited TCP ingestion server with admission control
//! - A pool of HTTP pollers with per-poller deduplication

mod connections;
mod error;
mod framing;
mod http;
mod normalize;
mod seen;
mod tcp;

pub use connections::{ConnectionGuard, ConnectionInfo, ConnectionRegistry};
pub use error::SourceError;
pub use framing::{LineOverflow, LineSplitter};
pub use http::{Poller, PollerConfig, PollerId, PollerInfo, PollerPool, parse_poll_url};
pub use normalize::{Normalizer, normalize_timestamp};
pub use seen::{MAX_SEEN_ENTRIES, SeenSet, dedup_key};
pub use tcp::{TcpIngestServer, TcpServerConfig};
