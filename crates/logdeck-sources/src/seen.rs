use std::collections::{HashSet, VecDeque};

use xxhash_rust::xxh3::Xxh3;

use logdeck_types::LogEntry;

/// Default ceiling on remembered keys per poller
pub const MAX_SEEN_ENTRIES: usize = 10_000;

const FIELD_SEPARATOR: u8 = 0x1f;
const NONE_MARKER: u8 = 0x00;

/// Bounded set of entry keys already forwarded by one HTTP poller.
///
/// Keys are xxh3-128 digests of the identifying fields. When the set grows
/// past its ceiling it is cut back to half, keeping the most recently
/// inserted keys. Lookups do not refresh a key's position.
#[derive(Debug)]
pub struct SeenSet {
    keys: HashSet<u128>,
    order: VecDeque<u128>,
    max_entries: usize,
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(MAX_SEEN_ENTRIES)
    }
}

impl SeenSet {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(2);
        Self {
            keys: HashSet::with_capacity(max_entries + 1),
            order: VecDeque::with_capacity(max_entries + 1),
            max_entries,
        }
    }

    /// Remember `entry`. Returns `true` if it had not been seen before.
    pub fn insert(&mut self, entry: &LogEntry) -> bool {
        let key = dedup_key(entry);
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);

        if self.keys.len() > self.max_entries {
            self.trim();
        }
        true
    }

    pub fn contains(&self, entry: &LogEntry) -> bool {
        self.keys.contains(&dedup_key(entry))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn trim(&mut self) {
        let keep = self.max_entries / 2;
        let evict = self.order.len().saturating_sub(keep);
        for key in self.order.drain(..evict) {
            self.keys.remove(&key);
        }
        tracing::debug!(evicted = evict, kept = keep, "Trimmed seen-entry set");
    }
}

/// Digest of the fields that identify a polled entry
pub fn dedup_key(entry: &LogEntry) -> u128 {
    let mut hasher = Xxh3::new();
    let mut field = |value: Option<&str>| {
        match value {
            Some(v) => hasher.update(v.as_bytes()),
            None => hasher.update(&[NONE_MARKER]),
        }
        hasher.update(&[FIELD_SEPARATOR]);
    };

    field(entry.timestamp.as_deref());
    field(Some(entry.level.as_str()));
    field(entry.logger.as_deref());
    field(entry.thread.as_deref());
    field(Some(entry.message.as_str()));
    field(entry.trace_id.as_deref());
    field(Some(entry.source.as_str()));

    hasher.digest128()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new("http://svc/logs", message).with_timestamp("2024-01-01T00:00:00.000Z")
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut seen = SeenSet::default();
        assert!(seen.insert(&entry("a")));
        assert!(!seen.insert(&entry("a")));
        assert!(seen.insert(&entry("b")));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_key_covers_identity_fields() {
        let base = entry("a");

        let mut other_thread = base.clone();
        other_thread.thread = Some("main".to_string());
        assert_ne!(dedup_key(&base), dedup_key(&other_thread));

        let mut other_source = base.clone();
        other_source.source = "http://other".to_string();
        assert_ne!(dedup_key(&base), dedup_key(&other_source));

        // Fields outside the key do not matter
        let mut other_raw = base.clone();
        other_raw.raw = Some("{}".to_string());
        assert_eq!(dedup_key(&base), dedup_key(&other_raw));
    }

    #[test]
    fn test_none_differs_from_empty() {
        let mut a = entry("x");
        a.logger = None;
        let mut b = entry("x");
        b.logger = Some(String::new());
        assert_ne!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn test_trim_keeps_newest_half() {
        let mut seen = SeenSet::new(10);
        for i in 0..10 {
            seen.insert(&entry(&i.to_string()));
        }
        assert_eq!(seen.len(), 10);

        seen.insert(&entry("10"));
        assert_eq!(seen.len(), 5);
        assert!(seen.contains(&entry("10")));
        assert!(seen.contains(&entry("6")));
        assert!(!seen.contains(&entry("5")));
        assert!(!seen.contains(&entry("0")));
    }

    #[test]
    fn test_never_exceeds_bound() {
        let mut seen = SeenSet::default();
        for i in 0..(MAX_SEEN_ENTRIES * 3 + 17) {
            seen.insert(&entry(&i.to_string()));
            assert!(seen.len() <= MAX_SEEN_ENTRIES);
        }
    }
}
