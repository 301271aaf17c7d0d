//! Periodic HTTP polling with per-poller deduplication.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use logdeck_types::{EntrySink, LogEntry, Route};

use crate::error::SourceError;
use crate::normalize::Normalizer;
use crate::seen::{MAX_SEEN_ENTRIES, SeenSet};

/// HTTP poller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Per-fetch deadline covering connect, headers and body
    pub timeout_ms: u64,

    /// Largest accepted response body
    pub max_response_bytes: u64,

    /// Requested intervals below this are raised to it
    pub min_interval_ms: u64,

    /// Dedup keys remembered per poller
    pub max_seen_entries: usize,

    pub user_agent: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_response_bytes: 100 * 1024 * 1024,
            min_interval_ms: 500,
            max_seen_entries: MAX_SEEN_ENTRIES,
            user_agent: concat!("logdeck/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PollerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Interval actually used for a requested one
    pub fn clamp_interval(&self, requested: Duration) -> Duration {
        requested.max(self.min_interval())
    }
}

/// Identifier of a running poller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollerId(pub u64);

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll-{}", self.0)
    }
}

/// Public view of a running poller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerInfo {
    pub id: PollerId,
    pub url: String,
    pub interval: Duration,
    pub route: Route,
}

/// Parse and check a poll target
pub fn parse_poll_url(url: &str) -> Result<Url, SourceError> {
    let parsed = Url::parse(url.trim()).map_err(|e| SourceError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(SourceError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// One polling target and its dedup state.
///
/// [`PollerPool`] drives `tick` from an interval timer; tests can drive it
/// directly.
pub struct Poller {
    client: Client,
    url: Url,
    source: String,
    config: Arc<PollerConfig>,
    seen: SeenSet,
    sink: Arc<dyn EntrySink>,
    route: Route,
    stopped: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(
        client: Client,
        url: Url,
        config: Arc<PollerConfig>,
        sink: Arc<dyn EntrySink>,
        route: Route,
    ) -> Self {
        Self {
            client,
            source: url.to_string(),
            seen: SeenSet::new(config.max_seen_entries),
            url,
            config,
            sink,
            route,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Fetch once and forward entries not seen before.
    ///
    /// Returns the number of entries forwarded. Failures are forwarded as a
    /// single ERROR entry. Nothing is forwarded once the poller is stopped.
    pub async fn tick(&mut self) -> usize {
        let result = self.fetch().await;
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }

        match result {
            Ok(body) => {
                let candidates = Normalizer::from_body(&body, &self.source);
                let total = candidates.len();
                let fresh: Vec<LogEntry> = candidates
                    .into_iter()
                    .filter(|entry| self.seen.insert(entry))
                    .collect();

                let forwarded = fresh.len();
                tracing::debug!(
                    url = %self.url,
                    received = total,
                    forwarded,
                    seen = self.seen.len(),
                    "Poll completed"
                );
                if forwarded > 0 {
                    self.sink.accept_batch(fresh, self.route);
                }
                forwarded
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Poll failed");
                self.sink.accept(
                    Normalizer::error_entry(&self.source, format!("HTTP poll of {} failed: {e}", self.url)),
                    self.route,
                );
                0
            }
        }
    }

    async fn fetch(&self) -> Result<String, SourceError> {
        let timeout = self.config.timeout();
        tokio::time::timeout(timeout, self.fetch_body())
            .await
            .map_err(|_| SourceError::Timeout(timeout))?
    }

    async fn fetch_body(&self) -> Result<String, SourceError> {
        let limit = self.config.max_response_bytes;
        let mut response = self.client.get(self.url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
            });
        }

        if response.content_length().is_some_and(|len| len > limit) {
            return Err(SourceError::ResponseTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(SourceError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

struct PollerHandle {
    info: PollerInfo,
    stopped: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    async fn stop(self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(poller = %self.info.id, "Poller task panicked");
            }
        }
    }
}

/// Set of running HTTP pollers sharing one client
pub struct PollerPool {
    client: Client,
    config: Arc<PollerConfig>,
    sink: Arc<dyn EntrySink>,
    pollers: Mutex<HashMap<PollerId, PollerHandle>>,
    next_id: AtomicU64,
}

impl PollerPool {
    pub fn new(config: PollerConfig, sink: Arc<dyn EntrySink>) -> Result<Self, SourceError> {
        let client = Client::builder().user_agent(config.user_agent.clone()).build()?;
        Ok(Self::with_client(client, config, sink))
    }

    pub fn with_client(client: Client, config: PollerConfig, sink: Arc<dyn EntrySink>) -> Self {
        Self {
            client,
            config: Arc::new(config),
            sink,
            pollers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start polling `url` every `interval` (raised to the configured floor).
    ///
    /// The first fetch happens immediately. Must be called within a tokio
    /// runtime.
    pub fn start_poll(&self, url: &str, interval: Duration, route: Route) -> Result<PollerId, SourceError> {
        let url = parse_poll_url(url)?;
        let interval = self.config.clamp_interval(interval);
        let id = PollerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let poller = Poller::new(
            self.client.clone(),
            url.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.sink),
            route,
        );
        let stopped = Arc::clone(&poller.stopped);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_poller(poller, interval, cancel.clone()));

        tracing::info!(poller = %id, url = %url, interval = ?interval, "Started HTTP poller");

        let info = PollerInfo {
            id,
            url: url.to_string(),
            interval,
            route,
        };
        self.pollers.lock().insert(
            id,
            PollerHandle {
                info,
                stopped,
                cancel,
                task,
            },
        );
        Ok(id)
    }

    /// Stop one poller and wait for its task to end.
    ///
    /// Returns `false` for an unknown id. After this returns the poller
    /// emits nothing further.
    pub async fn stop_poll(&self, id: PollerId) -> bool {
        let Some(handle) = self.pollers.lock().remove(&id) else {
            return false;
        };
        handle.stop().await;
        tracing::info!(poller = %id, "Stopped HTTP poller");
        true
    }

    /// Stop every poller
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<PollerHandle> = self.pollers.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles.into_iter().map(PollerHandle::stop)).await;
        if count > 0 {
            tracing::info!(count, "Stopped all HTTP pollers");
        }
        count
    }

    pub fn active_pollers(&self) -> Vec<PollerInfo> {
        let mut pollers: Vec<PollerInfo> = self.pollers.lock().values().map(|h| h.info.clone()).collect();
        pollers.sort_by_key(|p| p.id);
        pollers
    }

    pub fn len(&self) -> usize {
        self.pollers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.lock().is_empty()
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }
}

impl Drop for PollerPool {
    fn drop(&mut self) {
        for handle in self.pollers.get_mut().values() {
            handle.stopped.store(true, Ordering::Release);
            handle.cancel.cancel();
        }
    }
}

async fn run_poller(mut poller: Poller, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = poller.tick() => {}
        }
    }

    tracing::debug!(url = %poller.url, "Poller task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_clamped_to_floor() {
        let config = PollerConfig::default();
        assert_eq!(config.clamp_interval(Duration::from_millis(10)), Duration::from_millis(500));
        assert_eq!(config.clamp_interval(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_url_validation() {
        assert!(parse_poll_url("http://localhost:8080/logs").is_ok());
        assert!(parse_poll_url(" https://example.com/api ").is_ok());
        assert!(matches!(
            parse_poll_url("ftp://example.com"),
            Err(SourceError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_poll_url("not a url"),
            Err(SourceError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_poller_id_display() {
        assert_eq!(PollerId(4).to_string(), "poll-4");
    }
}
