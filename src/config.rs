use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use logdeck_elastic::ElasticConfig;
use logdeck_logs::HubConfig;
use logdeck_sources::{PollerConfig, TcpServerConfig, parse_poll_url};
use logdeck_types::{Route, WindowId};

/// Id the hub assigns to the first window registered, the stdout window
pub const STDOUT_WINDOW: WindowId = WindowId(1);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{field} targets {window}, but only {STDOUT_WINDOW} exists")]
    UnknownWindow { field: &'static str, window: WindowId },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Output format of the process's own diagnostics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One URL polled from startup
#[derive(Debug, Clone, Deserialize)]
pub struct PollTarget {
    pub url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Deliver only to this window
    #[serde(default)]
    pub window: Option<WindowId>,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl PollTarget {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn route(&self) -> Route {
        Route::from(self.window)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    #[serde(flatten)]
    pub poller: PollerConfig,

    pub pollers: Vec<PollTarget>,
}

/// Full application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default tracing directive when `RUST_LOG` is unset
    pub log_level: String,
    pub log_format: LogFormat,

    /// Message filter applied by the stdout window
    pub filter: Option<String>,

    pub tcp: TcpServerConfig,
    pub http: HttpSection,
    pub delivery: HubConfig,
    pub elastic: ElasticConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            filter: None,
            tcp: TcpServerConfig::default(),
            http: HttpSection::default(),
            delivery: HubConfig::default(),
            elastic: ElasticConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.max_connections == 0 {
            return Err(ConfigError::invalid("tcp.max_connections", "must be positive"));
        }
        if self.tcp.max_line_bytes == 0 {
            return Err(ConfigError::invalid("tcp.max_line_bytes", "must be positive"));
        }
        if self.tcp.idle_timeout_ms == 0 {
            return Err(ConfigError::invalid("tcp.idle_timeout_ms", "must be positive"));
        }

        check_window("tcp.window", self.tcp.window)?;

        if self.http.poller.max_seen_entries < 2 {
            return Err(ConfigError::invalid("http.max_seen_entries", "must be at least 2"));
        }
        if self.http.poller.max_response_bytes == 0 {
            return Err(ConfigError::invalid("http.max_response_bytes", "must be positive"));
        }
        for target in &self.http.pollers {
            check_window("http.pollers.window", target.window)?;
            parse_poll_url(&target.url).map_err(|e| ConfigError::InvalidUrl {
                url: target.url.clone(),
                reason: e.to_string(),
            })?;
        }

        let delivery = &self.delivery;
        if delivery.max_batch_entries == 0 {
            return Err(ConfigError::invalid("delivery.max_batch_entries", "must be positive"));
        }
        if delivery.min_pending_appends == 0 || delivery.min_pending_appends > delivery.max_pending_appends {
            return Err(ConfigError::invalid(
                "delivery.min_pending_appends",
                format!(
                    "must be between 1 and max_pending_appends ({})",
                    delivery.max_pending_appends
                ),
            ));
        }
        if !(0.0 < delivery.low_watermark && delivery.low_watermark < delivery.high_watermark && delivery.high_watermark <= 1.0) {
            return Err(ConfigError::invalid(
                "delivery watermarks",
                "expected 0 < low_watermark < high_watermark <= 1",
            ));
        }

        if self.elastic.enabled || self.elastic.query.is_some() {
            match url::Url::parse(&self.elastic.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => {
                    return Err(ConfigError::InvalidUrl {
                        url: self.elastic.base_url.clone(),
                        reason: format!("unsupported scheme '{}'", url.scheme()),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::InvalidUrl {
                        url: self.elastic.base_url.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            if self.elastic.index.trim().is_empty() {
                return Err(ConfigError::invalid("elastic.index", "must not be empty"));
            }
            if self.elastic.bulk_size == 0 {
                return Err(ConfigError::invalid("elastic.bulk_size", "must be positive"));
            }
        }

        Ok(())
    }
}

/// Entries routed to a window that is never registered would be dropped
fn check_window(field: &'static str, window: Option<WindowId>) -> Result<(), ConfigError> {
    match window {
        Some(window) if window != STDOUT_WINDOW => Err(ConfigError::UnknownWindow { field, window }),
        _ => Ok(()),
    }
}
