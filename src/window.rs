//! Headless window printing delivered entries to stdout

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use logdeck_logs::{BatchSample, DeliveryHub, MessageFilter};
use logdeck_types::{ArcLogEntry, Delivery, LogEntry, WindowId};

pub struct StdoutWindow {
    id: WindowId,
    hub: Arc<DeliveryHub>,
    filter: MessageFilter,
}

impl StdoutWindow {
    pub fn new(id: WindowId, hub: Arc<DeliveryHub>, filter: MessageFilter) -> Self {
        Self { id, hub, filter }
    }

    /// Consume deliveries until the hub drops the window's sender
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            match delivery {
                Delivery::Batch { window, entries } => {
                    if window != self.id {
                        tracing::debug!(%window, "Ignoring batch for another window");
                        continue;
                    }
                    let started = Instant::now();
                    let bytes = entries.iter().map(|e| e.approx_size()).sum();
                    if let Err(e) = self.print_batch(&entries).await {
                        tracing::warn!("Failed to write entries: {}", e);
                    }
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    self.hub.record_batch(BatchSample::new(elapsed, entries.len(), bytes));
                }
                Delivery::Status(status) => {
                    if status.ok {
                        tracing::info!(port = ?status.port, "{}", status.message);
                    } else {
                        tracing::warn!("{}", status.message);
                    }
                }
            }
        }
        tracing::debug!(window = %self.id, "Window closed");
    }

    async fn print_batch(&self, entries: &[ArcLogEntry]) -> io::Result<()> {
        let text = self.render_batch(entries);
        if text.is_empty() {
            return Ok(());
        }
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await
    }

    /// Matching entries one per line, stack traces indented below them
    fn render_batch(&self, entries: &[ArcLogEntry]) -> String {
        let mut text = String::new();
        for entry in entries.iter().filter(|e| self.filter.matches(e)) {
            text.push_str(&format_entry(entry));
            text.push('\n');
            if let Some(stack) = &entry.stack_trace {
                for line in stack.lines() {
                    text.push_str("    ");
                    text.push_str(line);
                    text.push('\n');
                }
            }
        }
        text
    }
}

fn format_entry(entry: &LogEntry) -> String {
    let mut line = format!(
        "{} [{}] {}",
        entry.timestamp.as_deref().unwrap_or("-"),
        entry.level,
        entry.source
    );
    if let Some(logger) = &entry.logger {
        line.push(' ');
        line.push_str(logger);
    }
    line.push_str(" | ");
    line.push_str(&entry.message);
    line
}
