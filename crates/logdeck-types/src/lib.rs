//! Shared types for logdeck
//!
//! This crate contains data structures used across multiple logdeck crates:
//! the canonical [`LogEntry`], routing information for windows, the
//! messages delivered to UI consumers and the [`EntrySink`] seam that
//! ingestion sources write into.

use std::fmt;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[cfg(feature = "test-util")]
pub mod testing;

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" | "trc" | "trce" | "finest" | "finer" => Some(Self::Trace),
            "debug" | "dbg" | "debg" | "fine" => Some(Self::Debug),
            "info" | "inf" | "information" | "notice" => Some(Self::Info),
            "warn" | "warning" | "wrn" => Some(Self::Warn),
            "error" | "err" | "erro" | "severe" => Some(Self::Error),
            "fatal" | "panic" | "critical" | "crit" | "ftl" | "emerg" | "alert" => {
                Some(Self::Fatal)
            }
            _ => None,
        }
    }

    /// Map numeric levels (bunyan/pino style: 10 = trace .. 60 = fatal)
    pub fn from_numeric(num: u64) -> Self {
        match num {
            0..=10 => Self::Trace,
            11..=20 => Self::Debug,
            21..=30 => Self::Info,
            31..=40 => Self::Warn,
            41..=50 => Self::Error,
            _ => Self::Fatal,
        }
    }

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Canonical level string for an arbitrary level name.
    ///
    /// Known aliases collapse to their canonical name, anything else is kept
    /// upper-cased so custom levels (e.g. `AUDIT`) survive normalization.
    pub fn normalize(s: &str) -> String {
        match Self::from_name(s) {
            Some(level) => level.as_str().to_string(),
            None => s.trim().to_uppercase(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical normalized log record flowing through the pipeline
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// ISO-8601 timestamp, `None` when the source carried none we could read
    pub timestamp: Option<String>,

    /// Normalized level name (`INFO`, `ERROR`, ...)
    pub level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,

    /// Always present, possibly empty
    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,

    /// Origin: `tcp:<ip>:<port>`, a URL, `elastic:<index>`, ...
    #[serde(default)]
    pub source: String,

    /// Original raw payload (line or JSON text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,

    /// Mapped diagnostic context and any extra structured fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub mdc: Map<String, Value>,
}

/// Shared handle to an entry; buffers fan the same entry out to several windows
pub type ArcLogEntry = Arc<LogEntry>;

impl LogEntry {
    /// Create a new log entry with minimal fields
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info.as_str().to_string(),
            message: message.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    /// Synthetic ERROR entry describing a pipeline failure
    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Some(now_iso()),
            level: LogLevel::Error.as_str().to_string(),
            logger: Some("logdeck".to_string()),
            ..Self::new(source, message)
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level.as_str().to_string();
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Parsed severity, `None` for custom levels
    pub fn severity(&self) -> Option<LogLevel> {
        LogLevel::from_name(&self.level)
    }

    /// Rough heap footprint in bytes, used for memory accounting
    pub fn approx_size(&self) -> usize {
        fn opt(s: &Option<String>) -> usize {
            s.as_ref().map_or(0, String::len)
        }

        std::mem::size_of::<Self>()
            + self.level.len()
            + self.message.len()
            + self.source.len()
            + opt(&self.timestamp)
            + opt(&self.logger)
            + opt(&self.thread)
            + opt(&self.trace_id)
            + opt(&self.span_id)
            + opt(&self.stack_trace)
            + opt(&self.raw)
            + self
                .mdc
                .iter()
                .map(|(k, v)| k.len() + value_size(v))
                .sum::<usize>()
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len() + 24,
        Value::Array(items) => 24 + items.iter().map(value_size).sum::<usize>(),
        Value::Object(map) => 48 + map.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>(),
        _ => 16,
    }
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Window & Routing Types
// ============================================================================

/// Identifier of a UI consumer window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Where an ingested entry should be delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Route {
    /// Untagged entries go to the primary window
    #[default]
    Primary,
    /// Source bound to one specific window
    Window(WindowId),
    /// Fan out to every registered window
    Broadcast,
}

impl From<Option<WindowId>> for Route {
    fn from(window: Option<WindowId>) -> Self {
        window.map_or(Self::Primary, Self::Window)
    }
}

// ============================================================================
// Delivery Types
// ============================================================================

/// TCP server state as reported to the UI
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ServerStatus {
    pub fn running(port: u16) -> Self {
        Self {
            ok: true,
            message: format!("TCP server listening on port {port}"),
            running: Some(true),
            port: Some(port),
        }
    }

    pub fn stopped() -> Self {
        Self {
            ok: true,
            message: "TCP server stopped".to_string(),
            running: Some(false),
            port: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            running: Some(false),
            port: None,
        }
    }
}

/// Message sent to a window
#[derive(Clone, Debug)]
pub enum Delivery {
    /// A batch of entries for one window
    Batch {
        window: WindowId,
        entries: Vec<ArcLogEntry>,
    },
    /// TCP server status change
    Status(ServerStatus),
}

// ============================================================================
// Ingestion Seam
// ============================================================================

/// Destination for normalized entries produced by ingestion sources.
///
/// Implementations must be cheap and non-blocking: sources call `accept`
/// from their I/O tasks for every entry.
pub trait EntrySink: Send + Sync {
    fn accept(&self, entry: LogEntry, route: Route);

    fn accept_batch(&self, entries: Vec<LogEntry>, route: Route) {
        for entry in entries {
            self.accept(entry, route);
        }
    }
}

impl<T: EntrySink + ?Sized> EntrySink for Arc<T> {
    fn accept(&self, entry: LogEntry, route: Route) {
        (**self).accept(entry, route)
    }

    fn accept_batch(&self, entries: Vec<LogEntry>, route: Route) {
        (**self).accept_batch(entries, route)
    }
}

/// Hands every entry to each of several sinks
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Arc<dyn EntrySink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EntrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EntrySink for FanOut {
    fn accept(&self, entry: LogEntry, route: Route) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.accept(entry.clone(), route);
            }
            last.accept(entry, route);
        }
    }

    fn accept_batch(&self, entries: Vec<LogEntry>, route: Route) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.accept_batch(entries.clone(), route);
            }
            last.accept_batch(entries, route);
        }
    }
}
