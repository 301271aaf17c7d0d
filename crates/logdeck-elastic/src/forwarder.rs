use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use logdeck_types::{EntrySink, LogEntry, Route};

use crate::indexer::BulkIndexer;

/// Background bulk indexing for everything ingested.
///
/// Entries are queued without blocking the producer; when the queue is full
/// new entries are counted as dropped.
pub struct ElasticForwarder {
    tx: mpsc::Sender<LogEntry>,
    dropped: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ElasticForwarder {
    pub fn spawn(indexer: Arc<BulkIndexer>) -> Self {
        let (tx, rx) = mpsc::channel(indexer.config().queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_forwarder(indexer, rx, cancel.clone()));

        Self {
            tx,
            dropped: AtomicU64::new(0),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Index what is still queued, then stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!("Elastic forwarder task failed: {}", e);
        }
    }
}

impl EntrySink for ElasticForwarder {
    fn accept(&self, entry: LogEntry, _route: Route) {
        if self.tx.try_send(entry).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "Elastic forwarder queue full, dropping entries");
            }
        }
    }
}

impl Drop for ElasticForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_forwarder(indexer: Arc<BulkIndexer>, mut rx: mpsc::Receiver<LogEntry>, cancel: CancellationToken) {
    let bulk_size = indexer.config().bulk_size.max(1);
    let mut ticker = interval(indexer.config().flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<LogEntry> = Vec::with_capacity(bulk_size);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= bulk_size {
                        indexer.index_bulk(&batch).await;
                        batch.clear();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    indexer.index_bulk(&batch).await;
                    batch.clear();
                }
            }
        }
    }

    rx.close();
    while let Some(entry) = rx.recv().await {
        batch.push(entry);
    }
    if !batch.is_empty() {
        tracing::debug!(count = batch.len(), "Indexing remaining entries before shutdown");
        indexer.index_bulk(&batch).await;
    }
}
