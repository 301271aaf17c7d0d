use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use logdeck_types::{LogEntry, LogLevel};

/// Leading ISO-8601 timestamp of a plain text line
static LEADING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?)")
        .expect("timestamp pattern is valid")
});

const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "@timestamp", "time", "ts", "date", "datetime"];
const LEVEL_FIELDS: &[&str] = &[
    "level",
    "severity",
    "lvl",
    "loglevel",
    "log_level",
    "log.level",
    "levelname",
    "Level",
    "LEVEL",
];
const LOGGER_FIELDS: &[&str] = &["logger", "logger_name", "loggerName", "log.logger", "name", "category"];
const THREAD_FIELDS: &[&str] = &["thread", "thread_name", "threadName", "process.thread.name"];
const MESSAGE_FIELDS: &[&str] = &["message", "msg", "log", "text", "body"];
const TRACE_FIELDS: &[&str] = &["traceId", "trace_id", "trace.id", "traceid", "X-B3-TraceId"];
const SPAN_FIELDS: &[&str] = &["spanId", "span_id", "span.id", "spanid", "X-B3-SpanId"];
const STACK_FIELDS: &[&str] = &[
    "stackTrace",
    "stack_trace",
    "stacktrace",
    "stack",
    "exception",
    "error.stack_trace",
];
const MDC_FIELDS: &[&str] = &["mdc", "context"];

/// Wrapper keys under which HTTP endpoints commonly return entry arrays
const COLLECTION_FIELDS: &[&str] = &["logs", "entries", "items", "data", "records"];

/// Converts raw TCP lines, HTTP bodies and Elasticsearch hits into [`LogEntry`] records
pub struct Normalizer;

impl Normalizer {
    /// Normalize one newline-delimited payload line.
    ///
    /// JSON object lines are mapped field by field; anything else becomes a
    /// minimal entry whose message is the raw line.
    pub fn from_line(line: &str, source: &str) -> LogEntry {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                return Self::from_object(map, source, Some(line.to_string()));
            }
        }
        Self::from_text(line, source)
    }

    /// Normalize a single JSON value (array element, hit source, ...)
    pub fn from_value(value: Value, source: &str) -> LogEntry {
        match value {
            Value::Object(map) => {
                let raw = serde_json::to_string(&map).ok();
                Self::from_object(map, source, raw)
            }
            Value::String(text) => Self::from_text(&text, source),
            other => Self::from_text(&other.to_string(), source),
        }
    }

    /// Normalize a whole HTTP response body.
    ///
    /// The body is sniffed from its first non-whitespace character: `[` or
    /// `{` means JSON, anything else (or JSON that fails to parse, such as
    /// NDJSON) is treated as newline-delimited text.
    pub fn from_body(body: &str, source: &str) -> Vec<LogEntry> {
        match body.trim_start().chars().next() {
            None => Vec::new(),
            Some('[') | Some('{') => match serde_json::from_str::<Value>(body) {
                Ok(document) => Self::from_document(document, source),
                Err(_) => Self::from_lines(body, source),
            },
            Some(_) => Self::from_lines(body, source),
        }
    }

    /// Normalize every non-blank line of a text body
    pub fn from_lines(body: &str, source: &str) -> Vec<LogEntry> {
        body.lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(|line| Self::from_line(line, source))
            .collect()
    }

    /// Normalize one Elasticsearch search hit
    pub fn from_elastic_hit(hit: Value, source: &str) -> LogEntry {
        let Value::Object(mut hit) = hit else {
            return Self::from_value(hit, source);
        };

        let id = hit.remove("_id");
        let index = hit.remove("_index");
        let mut entry = match hit.remove("_source") {
            Some(doc) => Self::from_value(doc, source),
            None => Self::from_value(Value::Object(hit), source),
        };

        if let Some(id) = id {
            entry.mdc.insert("_id".to_string(), id);
        }
        if let Some(index) = index {
            entry.mdc.insert("_index".to_string(), index);
        }
        entry
    }

    /// Synthetic ERROR entry for a failure observed at `source`
    pub fn error_entry(source: &str, message: impl Into<String>) -> LogEntry {
        LogEntry::error(source, message)
    }

    fn from_document(document: Value, source: &str) -> Vec<LogEntry> {
        match document {
            Value::Array(items) => items
                .into_iter()
                .map(|item| Self::from_value(item, source))
                .collect(),
            Value::Object(mut map) => {
                let has_hits = matches!(
                    map.get("hits").and_then(|hits| hits.get("hits")),
                    Some(Value::Array(_))
                );
                if has_hits {
                    if let Some(Value::Array(hits)) = map
                        .get_mut("hits")
                        .and_then(|hits| hits.get_mut("hits"))
                        .map(Value::take)
                    {
                        return hits
                            .into_iter()
                            .map(|hit| Self::from_elastic_hit(hit, source))
                            .collect();
                    }
                }

                for key in COLLECTION_FIELDS {
                    if matches!(map.get(*key), Some(Value::Array(_))) {
                        if let Some(Value::Array(items)) = map.remove(*key) {
                            return items
                                .into_iter()
                                .map(|item| Self::from_value(item, source))
                                .collect();
                        }
                    }
                }

                let raw = serde_json::to_string(&map).ok();
                vec![Self::from_object(map, source, raw)]
            }
            other => vec![Self::from_value(other, source)],
        }
    }

    fn from_object(mut map: Map<String, Value>, source: &str, raw: Option<String>) -> LogEntry {
        let timestamp = take_field(&mut map, TIMESTAMP_FIELDS).and_then(|v| normalize_timestamp(&v));
        let level = take_field(&mut map, LEVEL_FIELDS)
            .and_then(|v| level_from_value(&v))
            .unwrap_or_else(|| LogLevel::Info.as_str().to_string());
        let message = match take_field(&mut map, MESSAGE_FIELDS) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let logger = take_field(&mut map, LOGGER_FIELDS).and_then(value_to_string);
        let thread = take_field(&mut map, THREAD_FIELDS).and_then(value_to_string);
        let trace_id = take_field(&mut map, TRACE_FIELDS).and_then(value_to_string);
        let span_id = take_field(&mut map, SPAN_FIELDS).and_then(value_to_string);
        let stack_trace = take_field(&mut map, STACK_FIELDS).and_then(stack_to_string);

        let mut mdc = Map::new();
        if let Some(Value::Object(explicit)) = take_field(&mut map, MDC_FIELDS) {
            mdc.extend(explicit);
        }
        // Whatever is left is still useful context
        for (key, value) in map {
            mdc.entry(key).or_insert(value);
        }

        LogEntry {
            timestamp,
            level,
            logger,
            thread,
            message,
            trace_id,
            span_id,
            stack_trace,
            source: source.to_string(),
            raw,
            mdc,
        }
    }

    fn from_text(line: &str, source: &str) -> LogEntry {
        let timestamp = LEADING_TIMESTAMP
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_timestamp_str(m.as_str()));

        LogEntry {
            timestamp,
            level: extract_level_from_text(line)
                .unwrap_or(LogLevel::Info)
                .as_str()
                .to_string(),
            message: line.to_string(),
            source: source.to_string(),
            raw: Some(line.to_string()),
            ..Default::default()
        }
    }
}

/// Remove and return the first present field, also looking one level into
/// nested objects for dotted names (`log.level` → `{"log":{"level":..}}`)
fn take_field(map: &mut Map<String, Value>, names: &[&str]) -> Option<Value> {
    for name in names {
        if let Some(value) = map.remove(*name) {
            return Some(value);
        }
        if let Some((parent, child)) = name.split_once('.') {
            if let Some(Value::Object(nested)) = map.get_mut(parent) {
                if let Some(value) = nested.remove(child) {
                    if nested.is_empty() {
                        map.remove(parent);
                    }
                    return Some(value);
                }
            }
        }
    }
    None
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn stack_to_string(value: Value) -> Option<String> {
    match value {
        Value::Array(frames) => Some(
            frames
                .into_iter()
                .filter_map(value_to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        other => value_to_string(other),
    }
}

fn level_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(LogLevel::normalize(s)),
        Value::Number(n) => n
            .as_u64()
            .map(|num| LogLevel::from_numeric(num).as_str().to_string()),
        _ => None,
    }
}

/// Normalize a JSON timestamp (RFC 3339 string, common naive formats, or
/// epoch seconds/milliseconds) to RFC 3339 UTC with millisecond precision
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_f64().and_then(epoch_to_iso),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(num) = s.parse::<f64>() {
        return epoch_to_iso(num);
    }

    let normalized = s.replacen(',', ".", 1);
    if let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(to_iso(ts.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(&normalized, format) {
            return Some(to_iso(ts.with_timezone(&Utc)));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(to_iso(naive.and_utc()));
        }
    }
    None
}

fn epoch_to_iso(num: f64) -> Option<String> {
    if !num.is_finite() || num < 0.0 {
        return None;
    }
    // Anything past the year 33658 in seconds is really milliseconds
    let millis = if num >= 1e12 { num } else { num * 1000.0 };
    DateTime::from_timestamp_millis(millis as i64).map(to_iso)
}

fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Extract log level from plain text patterns
fn extract_level_from_text(content: &str) -> Option<LogLevel> {
    let upper = content.to_uppercase();

    // Check for bracketed patterns first [ERROR], [WARN], etc.
    let bracket_patterns = [
        ("[FATAL]", LogLevel::Fatal),
        ("[PANIC]", LogLevel::Fatal),
        ("[CRITICAL]", LogLevel::Fatal),
        ("[ERROR]", LogLevel::Error),
        ("[ERR]", LogLevel::Error),
        ("[WARN]", LogLevel::Warn),
        ("[WARNING]", LogLevel::Warn),
        ("[INFO]", LogLevel::Info),
        ("[DEBUG]", LogLevel::Debug),
        ("[TRACE]", LogLevel::Trace),
    ];

    for (pattern, level) in bracket_patterns {
        if upper.contains(pattern) {
            return Some(level);
        }
    }

    // Check for colon patterns: ERROR:, WARN:, etc.
    let colon_patterns = [
        ("FATAL:", LogLevel::Fatal),
        ("ERROR:", LogLevel::Error),
        ("WARNING:", LogLevel::Warn),
        ("WARN:", LogLevel::Warn),
        ("INFO:", LogLevel::Info),
        ("DEBUG:", LogLevel::Debug),
        ("TRACE:", LogLevel::Trace),
    ];

    for (pattern, level) in colon_patterns {
        if upper.contains(pattern) {
            return Some(level);
        }
    }

    // Check for spaced patterns: " ERROR ", " WARN ", etc.
    let spaced_patterns = [
        (" FATAL ", LogLevel::Fatal),
        (" ERROR ", LogLevel::Error),
        (" WARN ", LogLevel::Warn),
        (" WARNING ", LogLevel::Warn),
        (" INFO ", LogLevel::Info),
        (" DEBUG ", LogLevel::Debug),
        (" TRACE ", LogLevel::Trace),
    ];

    for (pattern, level) in spaced_patterns {
        if upper.contains(pattern) {
            return Some(level);
        }
    }

    let trimmed_upper = upper.trim_start();
    for (pattern, level) in [
        ("FATAL", LogLevel::Fatal),
        ("ERROR", LogLevel::Error),
        ("WARN", LogLevel::Warn),
        ("INFO", LogLevel::Info),
        ("DEBUG", LogLevel::Debug),
        ("TRACE", LogLevel::Trace),
    ] {
        if trimmed_upper.starts_with(pattern) {
            return Some(level);
        }
    }

    None
}
