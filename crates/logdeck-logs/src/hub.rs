//! Delivery hub: per-window pending buffers, the flush timer and window feedback.
//!
//! Producers append through [`EntrySink`]; every append is one short critical
//! section. The flush timer takes batches out under the lock and delivers
//! them outside it, so a slow or failing window never holds up producers or
//! the other windows.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use logdeck_types::{ArcLogEntry, Delivery, EntrySink, LogEntry, Route, ServerStatus, WindowId};

use crate::buffer::{BufferState, PendingBuffer};
use crate::capacity::{
    CapacityChange, CapacityConfig, CapacityGovernor, MAX_PENDING_APPENDS, MIN_PENDING_APPENDS, MemoryProbe,
    PendingBytesProbe,
};
use crate::error::DeliveryError;
use crate::registry::{WindowRegistry, WindowRole};
use crate::scheduler::{BatchSample, BatchScheduler, MAX_BATCH_ENTRIES};

/// Receiving end of a window as seen by the hub
pub trait WindowSink: Send + Sync {
    fn deliver(&self, window: WindowId, delivery: Delivery) -> Result<(), DeliveryError>;
}

impl WindowSink for mpsc::UnboundedSender<Delivery> {
    fn deliver(&self, window: WindowId, delivery: Delivery) -> Result<(), DeliveryError> {
        self.send(delivery).map_err(|_| DeliveryError::WindowClosed(window))
    }
}

impl WindowSink for mpsc::Sender<Delivery> {
    fn deliver(&self, window: WindowId, delivery: Delivery) -> Result<(), DeliveryError> {
        self.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::WindowBusy(window),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::WindowClosed(window),
        })
    }
}

/// Delivery hub configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Period of the flush timer
    pub flush_interval_ms: u64,

    /// Entries per delivery message
    pub max_batch_entries: usize,

    /// Soft cap on pending entries per window
    pub max_pending_appends: usize,

    /// Floor the cap may shrink to under memory pressure
    pub min_pending_appends: usize,

    /// Memory budget the pending buffers are measured against
    pub memory_budget_bytes: usize,

    pub capacity_check_interval_ms: u64,
    pub high_watermark: f64,
    pub low_watermark: f64,

    /// Pause before retrying a window whose delivery failed
    pub failure_backoff_ms: u64,

    pub initial_batch_delay_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_batch_entries: MAX_BATCH_ENTRIES,
            max_pending_appends: MAX_PENDING_APPENDS,
            min_pending_appends: MIN_PENDING_APPENDS,
            memory_budget_bytes: 256 * 1024 * 1024,
            capacity_check_interval_ms: 10_000,
            high_watermark: 0.75,
            low_watermark: 0.40,
            failure_backoff_ms: 1000,
            initial_batch_delay_ms: 16,
        }
    }
}

impl HubConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    fn capacity(&self) -> CapacityConfig {
        CapacityConfig {
            max_pending: self.max_pending_appends,
            min_pending: self.min_pending_appends,
            high_watermark: self.high_watermark,
            low_watermark: self.low_watermark,
            check_interval: Duration::from_millis(self.capacity_check_interval_ms),
        }
    }
}

/// Which buffers a flush pass serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Regular timer tick: every ready buffer not waiting on a continuation deadline
    Tick,
    /// Wakeup at a continuation deadline: only buffers whose deadline passed
    Continuation,
}

/// Outcome of one flush pass
#[derive(Debug, Default)]
pub struct FlushReport {
    pub batches: usize,
    pub entries: usize,
    pub failures: Vec<(WindowId, String)>,
}

/// Snapshot of one window's delivery state
#[derive(Clone, Debug)]
pub struct WindowStats {
    pub id: WindowId,
    pub role: WindowRole,
    pub ready: bool,
    pub state: BufferState,
    pub pending: usize,
    /// Entries ever buffered for this window
    pub appended: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failures: u64,
}

/// Snapshot of the whole hub
#[derive(Clone, Debug)]
pub struct HubStats {
    pub primary: Option<WindowId>,
    pub windows: Vec<WindowStats>,
    pub current_delay_ms: u64,
    pub pending_cap: usize,
    /// Entries that had no window to go to
    pub unrouted: u64,
    pub flush_ticks: u64,
}

struct WindowSlot {
    sink: Arc<dyn WindowSink>,
    buffer: PendingBuffer,
    delivered: u64,
    failures: u64,
}

struct HubState {
    registry: WindowRegistry,
    windows: HashMap<WindowId, WindowSlot>,
    scheduler: BatchScheduler,
    governor: CapacityGovernor,
    unrouted: u64,
}

struct PlannedBatch {
    window: WindowId,
    sink: Arc<dyn WindowSink>,
    entries: Vec<ArcLogEntry>,
}

/// Owns every window's pending buffer and drives delivery to them
pub struct DeliveryHub {
    config: HubConfig,
    state: Mutex<HubState>,
    probe: Box<dyn MemoryProbe>,
    flush_ticks: AtomicU64,
}

impl DeliveryHub {
    pub fn new(config: HubConfig) -> Self {
        let probe = PendingBytesProbe::new(config.memory_budget_bytes);
        Self::with_probe(config, Box::new(probe))
    }

    pub fn with_probe(config: HubConfig, probe: Box<dyn MemoryProbe>) -> Self {
        let state = HubState {
            registry: WindowRegistry::new(),
            windows: HashMap::new(),
            scheduler: BatchScheduler::with_delay(config.initial_batch_delay_ms),
            governor: CapacityGovernor::new(config.capacity()),
            unrouted: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
            probe,
            flush_ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // ========================================================================
    // Window lifecycle
    // ========================================================================

    /// Register a window; entries start accumulating for it immediately
    pub fn register_window(&self, role: WindowRole, sink: Arc<dyn WindowSink>) -> Result<WindowId, DeliveryError> {
        let mut state = self.state.lock();
        let id = state.registry.register(role)?;
        state.windows.insert(
            id,
            WindowSlot {
                sink,
                buffer: PendingBuffer::new(),
                delivered: 0,
                failures: 0,
            },
        );
        tracing::info!(window = %id, ?role, "Registered window");
        Ok(id)
    }

    /// Load-finished signal from the window's renderer
    pub fn mark_ready(&self, id: WindowId) -> Result<(), DeliveryError> {
        if self.state.lock().registry.mark_ready(id) {
            tracing::debug!(window = %id, "Window ready");
            Ok(())
        } else {
            Err(DeliveryError::UnknownWindow(id))
        }
    }

    pub fn is_ready(&self, id: WindowId) -> bool {
        self.state.lock().registry.is_ready(id)
    }

    /// Drop a window together with its pending entries
    pub fn close_window(&self, id: WindowId) -> bool {
        let mut state = self.state.lock();
        if !state.registry.remove(id) {
            return false;
        }
        let discarded = state.windows.remove(&id).map_or(0, |slot| slot.buffer.len());
        tracing::info!(window = %id, discarded, "Closed window");
        true
    }

    /// Feedback after a window processed a batch; returns the new delay in ms
    pub fn record_batch(&self, sample: BatchSample) -> u64 {
        self.state.lock().scheduler.record(sample)
    }

    /// Send a status message to every window right away
    pub fn broadcast_status(&self, status: ServerStatus) {
        let sinks: Vec<(WindowId, Arc<dyn WindowSink>)> = {
            let state = self.state.lock();
            state
                .registry
                .flush_order()
                .into_iter()
                .filter_map(|id| state.windows.get(&id).map(|slot| (id, Arc::clone(&slot.sink))))
                .collect()
        };

        for (id, sink) in sinks {
            if let Err(e) = sink.deliver(id, Delivery::Status(status.clone())) {
                tracing::warn!(window = %id, error = %e, "Failed to send status");
            }
        }
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    fn append(&self, entries: Vec<LogEntry>, route: Route) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let targets = state.registry.targets(route);
        if targets.is_empty() {
            state.unrouted += entries.len() as u64;
            tracing::debug!(?route, count = entries.len(), "No window for route, dropping entries");
            return;
        }

        let cap = state.governor.cap();
        let mut dropped = 0;
        for entry in entries {
            let entry = Arc::new(entry);
            for id in &targets {
                if let Some(slot) = state.windows.get_mut(id) {
                    dropped += slot.buffer.push(Arc::clone(&entry), cap);
                }
            }
        }

        if dropped > 0 {
            tracing::debug!(dropped, cap, "Pending buffer full, dropped oldest entries");
        }
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Take due batches and deliver them
    pub fn flush(&self, now: Instant, mode: FlushMode) -> FlushReport {
        let mut report = FlushReport::default();
        for batch in self.plan_batches(now, mode, &HashSet::new()) {
            self.deliver(batch, now, &mut report);
        }
        report
    }

    /// Deliver everything pending for ready windows, ignoring batch delays
    pub fn drain_ready(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut failed = HashSet::new();

        loop {
            let now = Instant::now();
            let planned = self.plan_batches(now, FlushMode::Tick, &failed);
            if planned.is_empty() {
                break;
            }
            for batch in planned {
                let window = batch.window;
                let failures = report.failures.len();
                self.deliver(batch, now, &mut report);
                if report.failures.len() > failures {
                    failed.insert(window);
                }
            }
            // Continuation deadlines do not apply while draining
            let mut state = self.state.lock();
            for slot in state.windows.values_mut() {
                slot.buffer.set_next_batch_at(None);
            }
        }

        report
    }

    fn plan_batches(&self, now: Instant, mode: FlushMode, skip: &HashSet<WindowId>) -> Vec<PlannedBatch> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let delay = state.scheduler.current_delay();

        let mut planned = Vec::new();
        for id in state.registry.flush_order() {
            if skip.contains(&id) || !state.registry.is_ready(id) {
                continue;
            }
            let Some(slot) = state.windows.get_mut(&id) else {
                continue;
            };
            if !slot.buffer.is_due(now, mode == FlushMode::Tick) {
                continue;
            }

            let entries = slot.buffer.take_batch(self.config.max_batch_entries.max(1));
            let next = (!slot.buffer.is_empty()).then(|| now + delay);
            slot.buffer.set_next_batch_at(next);
            planned.push(PlannedBatch {
                window: id,
                sink: Arc::clone(&slot.sink),
                entries,
            });
        }
        planned
    }

    fn deliver(&self, batch: PlannedBatch, now: Instant, report: &mut FlushReport) {
        let PlannedBatch { window, sink, entries } = batch;
        let count = entries.len();
        let delivery = Delivery::Batch {
            window,
            entries: entries.clone(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| sink.deliver(window, delivery)));
        let (error, closed) = match outcome {
            Ok(Ok(())) => {
                if let Some(slot) = self.state.lock().windows.get_mut(&window) {
                    slot.delivered += count as u64;
                }
                report.batches += 1;
                report.entries += count;
                return;
            }
            Ok(Err(e)) => {
                let closed = matches!(e, DeliveryError::WindowClosed(_));
                (e.to_string(), closed)
            }
            Err(panic) => (format!("delivery panicked: {}", panic_message(panic.as_ref())), false),
        };

        tracing::warn!(window = %window, error = %error, "Delivery to window failed");
        report.failures.push((window, error));

        if closed {
            self.close_window(window);
            return;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cap = state.governor.cap();
        if let Some(slot) = state.windows.get_mut(&window) {
            slot.failures += 1;
            slot.buffer.requeue_front(entries, cap);
            slot.buffer.set_next_batch_at(Some(now + self.config.failure_backoff()));
        }
    }

    /// Earliest continuation deadline of any buffer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .windows
            .values()
            .filter(|slot| !slot.buffer.is_empty())
            .filter_map(|slot| slot.buffer.next_batch_at())
            .min()
    }

    /// Re-evaluate the pending cap if the check interval elapsed
    pub fn maintain_capacity(&self, now: Instant) -> CapacityChange {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.governor.is_due(now) {
            return CapacityChange::Unchanged;
        }

        let pending_bytes: usize = state.windows.values().map(|slot| slot.buffer.bytes()).sum();
        let usage = self.probe.usage_ratio(pending_bytes);
        let change = state.governor.evaluate(usage, now);

        if let CapacityChange::Shrunk { to, .. } = change {
            let trimmed: usize = state.windows.values_mut().map(|slot| slot.buffer.trim_to(to)).sum();
            if trimmed > 0 {
                tracing::warn!(trimmed, cap = to, "Trimmed pending buffers to new cap");
            }
        }
        change
    }

    /// One timer cycle; regular ticks also re-evaluate capacity
    fn run_cycle(&self, now: Instant, mode: FlushMode) -> FlushReport {
        if mode == FlushMode::Tick {
            self.flush_ticks.fetch_add(1, Ordering::Relaxed);
            self.maintain_capacity(now);
        }
        self.flush(now, mode)
    }

    /// Spawn the flush timer on the current runtime
    pub fn spawn_flush_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_flush_timer(cancel))
    }

    /// Fire every flush interval and at continuation deadlines until cancelled.
    ///
    /// A failing cycle is logged and the loop carries on.
    pub async fn run_flush_timer(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.flush_interval();
        let mut next_tick = Instant::now() + period;

        loop {
            let wake = match self.next_deadline() {
                Some(at) if at < next_tick => at,
                _ => next_tick,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake) => {}
            }

            let now = Instant::now();
            let mode = if now >= next_tick {
                next_tick += period;
                if next_tick <= now {
                    next_tick = now + period;
                }
                FlushMode::Tick
            } else {
                FlushMode::Continuation
            };

            match catch_unwind(AssertUnwindSafe(|| self.run_cycle(now, mode))) {
                Ok(report) if !report.failures.is_empty() => {
                    tracing::debug!(
                        delivered = report.entries,
                        failed_windows = report.failures.len(),
                        "Flush cycle completed with failures"
                    );
                }
                Ok(_) => {}
                Err(panic) => {
                    tracing::error!(error = %panic_message(panic.as_ref()), "Flush cycle panicked");
                }
            }
        }

        tracing::debug!("Flush timer stopped");
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn pending(&self, id: WindowId) -> Option<usize> {
        self.state.lock().windows.get(&id).map(|slot| slot.buffer.len())
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.state.lock().scheduler.current_delay_ms()
    }

    pub fn pending_cap(&self) -> usize {
        self.state.lock().governor.cap()
    }

    pub fn flush_ticks(&self) -> u64 {
        self.flush_ticks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        let windows = state
            .registry
            .flush_order()
            .into_iter()
            .filter_map(|id| {
                let slot = state.windows.get(&id)?;
                Some(WindowStats {
                    id,
                    role: state.registry.role(id)?,
                    ready: state.registry.is_ready(id),
                    state: slot.buffer.state(),
                    pending: slot.buffer.len(),
                    appended: slot.buffer.appended(),
                    dropped: slot.buffer.dropped(),
                    delivered: slot.delivered,
                    failures: slot.failures,
                })
            })
            .collect();

        HubStats {
            primary: state.registry.primary(),
            windows,
            current_delay_ms: state.scheduler.current_delay_ms(),
            pending_cap: state.governor.cap(),
            unrouted: state.unrouted,
            flush_ticks: self.flush_ticks(),
        }
    }
}

impl EntrySink for DeliveryHub {
    fn accept(&self, entry: LogEntry, route: Route) {
        self.append(vec![entry], route);
    }

    fn accept_batch(&self, entries: Vec<LogEntry>, route: Route) {
        if !entries.is_empty() {
            self.append(entries, route);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
