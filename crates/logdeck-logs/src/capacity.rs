use std::time::Duration;

use tokio::time::Instant;

/// Default soft cap on pending entries per window
pub const MAX_PENDING_APPENDS: usize = 5000;

/// The cap never shrinks below this
pub const MIN_PENDING_APPENDS: usize = 1000;

/// Reports memory usage as a ratio of the available budget
pub trait MemoryProbe: Send + Sync {
    /// `pending_bytes` is the estimated footprint of all pending buffers
    fn usage_ratio(&self, pending_bytes: usize) -> f64;
}

/// Estimates usage from the bytes held by pending buffers
#[derive(Clone, Copy, Debug)]
pub struct PendingBytesProbe {
    budget_bytes: usize,
}

impl PendingBytesProbe {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes: budget_bytes.max(1),
        }
    }
}

impl MemoryProbe for PendingBytesProbe {
    fn usage_ratio(&self, pending_bytes: usize) -> f64 {
        pending_bytes as f64 / self.budget_bytes as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemoryPressure {
    Low,
    Normal,
    High,
}

/// Outcome of one capacity evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityChange {
    Unchanged,
    Shrunk { from: usize, to: usize },
    Grown { from: usize, to: usize },
}

#[derive(Clone, Debug)]
pub struct CapacityConfig {
    pub max_pending: usize,
    pub min_pending: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub check_interval: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_pending: MAX_PENDING_APPENDS,
            min_pending: MIN_PENDING_APPENDS,
            high_watermark: 0.75,
            low_watermark: 0.40,
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Adjusts the pending-entry cap to memory pressure
#[derive(Debug)]
pub struct CapacityGovernor {
    config: CapacityConfig,
    cap: usize,
    last_check: Option<Instant>,
}

impl CapacityGovernor {
    pub fn new(config: CapacityConfig) -> Self {
        let min_pending = config.min_pending.max(1);
        let max_pending = config.max_pending.max(min_pending);
        Self {
            cap: max_pending,
            config: CapacityConfig {
                min_pending,
                max_pending,
                ..config
            },
            last_check: None,
        }
    }

    /// Current soft cap
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Whether the check interval has elapsed since the last evaluation
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_check
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.check_interval)
    }

    pub fn pressure(&self, usage: f64) -> MemoryPressure {
        if usage > self.config.high_watermark {
            MemoryPressure::High
        } else if usage < self.config.low_watermark {
            MemoryPressure::Low
        } else {
            MemoryPressure::Normal
        }
    }

    /// Re-evaluate the cap for the observed usage ratio
    pub fn evaluate(&mut self, usage: f64, now: Instant) -> CapacityChange {
        self.last_check = Some(now);
        let from = self.cap;

        let to = match self.pressure(usage) {
            MemoryPressure::High => (from / 2).max(self.config.min_pending),
            MemoryPressure::Low => (from + from.div_ceil(4)).min(self.config.max_pending),
            MemoryPressure::Normal => from,
        };
        self.cap = to;

        if to < from {
            tracing::warn!(usage, from, to, "Memory pressure high, shrinking pending cap");
            CapacityChange::Shrunk { from, to }
        } else if to > from {
            tracing::debug!(usage, from, to, "Memory pressure low, growing pending cap");
            CapacityChange::Grown { from, to }
        } else {
            CapacityChange::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shrinks_to_floor_under_pressure() {
        let mut governor = CapacityGovernor::new(CapacityConfig::default());
        let now = Instant::now();

        assert_eq!(
            governor.evaluate(0.9, now),
            CapacityChange::Shrunk { from: 5000, to: 2500 }
        );
        governor.evaluate(0.9, now);
        assert_eq!(governor.cap(), 1250);
        governor.evaluate(0.9, now);
        assert_eq!(governor.cap(), MIN_PENDING_APPENDS);
        assert_eq!(governor.evaluate(0.9, now), CapacityChange::Unchanged);
    }

    #[test]
    fn test_grows_back_to_max() {
        let mut governor = CapacityGovernor::new(CapacityConfig::default());
        let now = Instant::now();
        for _ in 0..5 {
            governor.evaluate(0.99, now);
        }
        assert_eq!(governor.cap(), MIN_PENDING_APPENDS);

        assert_eq!(
            governor.evaluate(0.1, now),
            CapacityChange::Grown { from: 1000, to: 1250 }
        );
        for _ in 0..20 {
            governor.evaluate(0.1, now);
        }
        assert_eq!(governor.cap(), MAX_PENDING_APPENDS);
    }

    #[test]
    fn test_normal_usage_holds() {
        let mut governor = CapacityGovernor::new(CapacityConfig::default());
        assert_eq!(governor.evaluate(0.5, Instant::now()), CapacityChange::Unchanged);
        assert_eq!(governor.cap(), MAX_PENDING_APPENDS);
    }

    #[test]
    fn test_check_interval() {
        let mut governor = CapacityGovernor::new(CapacityConfig::default());
        let start = Instant::now();
        assert!(governor.is_due(start));

        governor.evaluate(0.5, start);
        assert!(!governor.is_due(start + Duration::from_secs(5)));
        assert!(governor.is_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_pending_bytes_probe() {
        let probe = PendingBytesProbe::new(1000);
        assert_eq!(probe.usage_ratio(750), 0.75);
        assert_eq!(PendingBytesProbe::new(0).usage_ratio(0), 0.0);
    }
}
