//! In-memory sink for tests

use parking_lot::Mutex;

use crate::{EntrySink, LogEntry, Route};

/// Collects every accepted entry together with its route
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(LogEntry, Route)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn routed(&self) -> Vec<(LogEntry, Route)> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EntrySink for MemorySink {
    fn accept(&self, entry: LogEntry, route: Route) {
        self.entries.lock().push((entry, route));
    }
}
