//! Adaptive inter-batch delay.
//!
//! Windows report how long they spent processing each batch. The scheduler
//! projects that onto a full batch and nudges the delay between consecutive
//! batches up when delivery is slow and down when it is fast.

use std::collections::VecDeque;
use std::time::Duration;

/// Lower bound for the inter-batch delay
pub const MIN_BATCH_DELAY_MS: u64 = 4;

/// Upper bound for the inter-batch delay
pub const MAX_BATCH_DELAY_MS: u64 = 100;

/// Entries per delivery message
pub const MAX_BATCH_ENTRIES: usize = 100;

const INITIAL_BATCH_DELAY_MS: u64 = 16;
const SAMPLE_WINDOW: usize = 5;

/// Projected full-batch cost above which a sample counts as slow
const SLOW_BATCH_MS: f64 = 16.0;

/// Projected full-batch cost below which a sample counts as fast
const FAST_BATCH_MS: f64 = 8.0;

/// Serialization cost charged per 64 KiB of payload
const BYTES_PER_MS: f64 = 64.0 * 1024.0;

const MAX_RAISE_STEP_MS: u64 = 16;
const MAX_LOWER_STEP_MS: u64 = 4;

/// One delivery measurement reported back by a window
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchSample {
    pub processing_ms: f64,
    pub batch_size: usize,
    pub bytes: usize,
}

impl BatchSample {
    pub fn new(processing_ms: f64, batch_size: usize, bytes: usize) -> Self {
        Self {
            processing_ms: processing_ms.max(0.0),
            batch_size,
            bytes,
        }
    }

    /// Estimated milliseconds to process a full batch at this sample's rate
    pub fn projected_cost_ms(&self) -> f64 {
        let size = self.batch_size.max(1) as f64;
        let per_entry = (self.processing_ms + self.bytes as f64 / BYTES_PER_MS) / size;
        per_entry * MAX_BATCH_ENTRIES as f64
    }
}

/// Classification of a single sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pace {
    Slow,
    Steady,
    Fast,
}

impl Pace {
    fn of(cost_ms: f64) -> Self {
        if cost_ms > SLOW_BATCH_MS {
            Self::Slow
        } else if cost_ms < FAST_BATCH_MS {
            Self::Fast
        } else {
            Self::Steady
        }
    }
}

/// Current inter-batch delay and the samples it was derived from
#[derive(Debug)]
pub struct BatchScheduler {
    current_delay_ms: u64,
    samples: VecDeque<BatchSample>,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self::with_delay(INITIAL_BATCH_DELAY_MS)
    }

    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            current_delay_ms: delay_ms.clamp(MIN_BATCH_DELAY_MS, MAX_BATCH_DELAY_MS),
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    /// Feed one sample and return the updated delay in milliseconds.
    ///
    /// The sample's own pace decides the direction; the rolling average of
    /// the last samples decides the step, so a lone outlier moves the delay
    /// by a single step.
    pub fn record(&mut self, sample: BatchSample) -> u64 {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let average = self.average_cost_ms();
        let previous = self.current_delay_ms;

        self.current_delay_ms = match Pace::of(sample.projected_cost_ms()) {
            Pace::Slow => {
                let step = ((average / SLOW_BATCH_MS).ceil() as u64).clamp(1, MAX_RAISE_STEP_MS);
                previous.saturating_add(step).min(MAX_BATCH_DELAY_MS)
            }
            Pace::Fast => {
                let step = ((FAST_BATCH_MS / average.max(1.0)).floor() as u64).clamp(1, MAX_LOWER_STEP_MS);
                previous.saturating_sub(step).max(MIN_BATCH_DELAY_MS)
            }
            Pace::Steady => previous,
        };

        if self.current_delay_ms != previous {
            tracing::trace!(
                from = previous,
                to = self.current_delay_ms,
                average_cost_ms = average,
                "Adjusted batch delay"
            );
        }
        self.current_delay_ms
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.current_delay_ms
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.current_delay_ms)
    }

    /// Mean projected cost over the rolling window, 0 when empty
    pub fn average_cost_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(BatchSample::projected_cost_ms).sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slow() -> BatchSample {
        BatchSample::new(40.0, 100, 0)
    }

    fn fast() -> BatchSample {
        BatchSample::new(1.0, 100, 0)
    }

    #[test]
    fn test_projected_cost_scales_to_full_batch() {
        assert_eq!(BatchSample::new(5.0, 50, 0).projected_cost_ms(), 10.0);
        assert_eq!(BatchSample::new(0.0, 100, 64 * 1024).projected_cost_ms(), 1.0);
        // Empty batches do not divide by zero
        assert!(BatchSample::new(3.0, 0, 0).projected_cost_ms().is_finite());
    }

    #[test]
    fn test_slow_samples_raise_monotonically() {
        let mut scheduler = BatchScheduler::new();
        let mut last = scheduler.current_delay_ms();
        for _ in 0..50 {
            let next = scheduler.record(slow());
            assert!(next > last || next == MAX_BATCH_DELAY_MS);
            last = next;
        }
        assert_eq!(last, MAX_BATCH_DELAY_MS);
    }

    #[test]
    fn test_fast_samples_lower_monotonically() {
        let mut scheduler = BatchScheduler::with_delay(MAX_BATCH_DELAY_MS);
        let mut last = scheduler.current_delay_ms();
        for _ in 0..200 {
            let next = scheduler.record(fast());
            assert!(next < last || next == MIN_BATCH_DELAY_MS);
            last = next;
        }
        assert_eq!(last, MIN_BATCH_DELAY_MS);
    }

    #[test]
    fn test_steady_sample_holds_delay() {
        let mut scheduler = BatchScheduler::with_delay(30);
        assert_eq!(scheduler.record(BatchSample::new(12.0, 100, 0)), 30);
    }

    #[test]
    fn test_single_spike_moves_one_step() {
        let mut scheduler = BatchScheduler::with_delay(20);
        for _ in 0..4 {
            scheduler.record(BatchSample::new(10.0, 100, 0));
        }
        assert_eq!(scheduler.current_delay_ms(), 20);

        let after_spike = scheduler.record(BatchSample::new(200.0, 100, 0));
        assert!(after_spike > 20);
        assert_eq!(scheduler.record(BatchSample::new(10.0, 100, 0)), after_spike);
    }

    #[test]
    fn test_initial_delay_is_clamped() {
        assert_eq!(BatchScheduler::with_delay(0).current_delay_ms(), MIN_BATCH_DELAY_MS);
        assert_eq!(BatchScheduler::with_delay(1000).current_delay_ms(), MAX_BATCH_DELAY_MS);
    }

    proptest! {
        #[test]
        fn delay_stays_in_bounds(
            samples in proptest::collection::vec((0.0f64..10_000.0, 0usize..500, 0usize..10_000_000), 0..100),
        ) {
            let mut scheduler = BatchScheduler::new();
            for (ms, size, bytes) in samples {
                let delay = scheduler.record(BatchSample::new(ms, size, bytes));
                prop_assert!((MIN_BATCH_DELAY_MS..=MAX_BATCH_DELAY_MS).contains(&delay));
            }
        }
    }
}
