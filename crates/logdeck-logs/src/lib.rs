//! Log delivery for logdeck
//!
//! This crate provides per-window pending buffers, the adaptive batch
//! scheduler, window registration and readiness, the flush timer and the
//! message filter grammar.

mod buffer;
mod capacity;
mod error;
mod filter;
mod hub;
mod registry;
mod scheduler;

pub use buffer::{BufferState, PendingBuffer};
pub use capacity::{
    CapacityChange, CapacityConfig, CapacityGovernor, MAX_PENDING_APPENDS, MIN_PENDING_APPENDS, MemoryPressure,
    MemoryProbe, PendingBytesProbe,
};
pub use error::DeliveryError;
pub use filter::{FilterError, MessageFilter};
pub use hub::{DeliveryHub, FlushMode, FlushReport, HubConfig, HubStats, WindowSink, WindowStats};
pub use registry::{WindowRegistry, WindowRole};
pub use scheduler::{BatchSample, BatchScheduler, MAX_BATCH_DELAY_MS, MAX_BATCH_ENTRIES, MIN_BATCH_DELAY_MS, Pace};

// Re-export types used in our public API
pub use logdeck_types::{Delivery, LogEntry, Route, WindowId};
