use std::collections::VecDeque;

use tokio::time::Instant;

use logdeck_types::ArcLogEntry;

/// Where a pending buffer is in its delivery cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Nothing queued
    Empty,
    /// Entries queued, waiting for the next flush tick
    Accumulating,
    /// Draining in batches; the next batch is due at the continuation deadline
    Flushing,
}

/// Bounded FIFO of entries waiting for delivery to one window.
///
/// The cap is soft and owned by the caller (it changes with memory
/// pressure), so it is passed on every push. Overflow drops the oldest
/// entries.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    entries: VecDeque<ArcLogEntry>,

    /// Approximate heap bytes held
    bytes: usize,

    /// Entries ever appended
    appended: u64,

    /// Entries evicted by the cap
    dropped: u64,

    /// Deadline of the next continuation batch while flushing
    next_batch_at: Option<Instant>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest ones beyond `cap`.
    ///
    /// Returns the number of entries dropped.
    pub fn push(&mut self, entry: ArcLogEntry, cap: usize) -> usize {
        self.bytes += entry.approx_size();
        self.entries.push_back(entry);
        self.appended += 1;
        self.trim_to(cap)
    }

    /// Drop oldest entries until at most `cap` remain
    pub fn trim_to(&mut self, cap: usize) -> usize {
        let excess = self.entries.len().saturating_sub(cap.max(1));
        for _ in 0..excess {
            if let Some(entry) = self.entries.pop_front() {
                self.bytes = self.bytes.saturating_sub(entry.approx_size());
            }
        }
        self.dropped += excess as u64;
        excess
    }

    /// Remove up to `max` entries from the front
    pub fn take_batch(&mut self, max: usize) -> Vec<ArcLogEntry> {
        let count = max.min(self.entries.len());
        let batch: Vec<ArcLogEntry> = self.entries.drain(..count).collect();
        let size: usize = batch.iter().map(|e| e.approx_size()).sum();
        self.bytes = self.bytes.saturating_sub(size);
        batch
    }

    /// Put an undelivered batch back at the front, keeping its order
    pub fn requeue_front(&mut self, batch: Vec<ArcLogEntry>, cap: usize) -> usize {
        for entry in batch.into_iter().rev() {
            self.bytes += entry.approx_size();
            self.entries.push_front(entry);
        }
        self.trim_to(cap)
    }

    pub fn state(&self) -> BufferState {
        match (self.entries.is_empty(), self.next_batch_at) {
            (true, _) => BufferState::Empty,
            (false, Some(_)) => BufferState::Flushing,
            (false, None) => BufferState::Accumulating,
        }
    }

    pub fn next_batch_at(&self) -> Option<Instant> {
        self.next_batch_at
    }

    pub fn set_next_batch_at(&mut self, at: Option<Instant>) {
        self.next_batch_at = at;
    }

    /// Whether a batch may be taken at `now`.
    ///
    /// Regular ticks serve every buffer whose continuation deadline has
    /// passed or that has none; continuation wakeups only serve the former.
    pub fn is_due(&self, now: Instant, regular_tick: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        match self.next_batch_at {
            Some(at) => at <= now,
            None => regular_tick,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use logdeck_types::LogEntry;

    use super::*;

    fn entry(message: &str) -> ArcLogEntry {
        Arc::new(LogEntry::new("test", message))
    }

    fn messages(batch: &[ArcLogEntry]) -> Vec<&str> {
        batch.iter().map(|e| e.message.as_str()).collect()
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = PendingBuffer::new();
        for i in 0..5 {
            buffer.push(entry(&i.to_string()), 3);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.appended(), 5);
        assert_eq!(messages(&buffer.take_batch(10)), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_take_batch_is_fifo_and_bounded() {
        let mut buffer = PendingBuffer::new();
        for i in 0..250 {
            buffer.push(entry(&i.to_string()), 5000);
        }

        let first = buffer.take_batch(100);
        assert_eq!(first.len(), 100);
        assert_eq!(first[0].message, "0");
        assert_eq!(buffer.len(), 150);

        buffer.take_batch(100);
        let last = buffer.take_batch(100);
        assert_eq!(last.len(), 50);
        assert_eq!(last[49].message, "249");
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_requeue_keeps_order() {
        let mut buffer = PendingBuffer::new();
        for i in 0..4 {
            buffer.push(entry(&i.to_string()), 100);
        }
        let batch = buffer.take_batch(2);
        buffer.push(entry("4"), 100);
        buffer.requeue_front(batch, 100);

        assert_eq!(messages(&buffer.take_batch(10)), vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_state_machine() {
        let mut buffer = PendingBuffer::new();
        assert_eq!(buffer.state(), BufferState::Empty);

        buffer.push(entry("a"), 10);
        buffer.push(entry("b"), 10);
        assert_eq!(buffer.state(), BufferState::Accumulating);

        let now = Instant::now();
        assert!(buffer.is_due(now, true));
        assert!(!buffer.is_due(now, false));

        buffer.take_batch(1);
        buffer.set_next_batch_at(Some(now + Duration::from_millis(10)));
        assert_eq!(buffer.state(), BufferState::Flushing);
        assert!(!buffer.is_due(now, true));
        assert!(buffer.is_due(now + Duration::from_millis(10), false));

        buffer.take_batch(1);
        assert_eq!(buffer.state(), BufferState::Empty);
    }
}
