use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use logdeck_elastic::{BulkIndexer, ElasticForwarder, ElasticSource};
use logdeck_logs::{DeliveryHub, MessageFilter, WindowRole};
use logdeck_sources::{Normalizer, PollerPool, TcpIngestServer};
use logdeck_types::{EntrySink, FanOut, Route, ServerStatus};

mod config;
mod window;

use config::{AppConfig, LogFormat, PollTarget};
use window::StdoutWindow;

/// logdeck - live log ingestion over TCP and HTTP polling
#[derive(Parser, Debug)]
#[command(name = "logdeck")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "LOGDECK_CONFIG")]
    config: Option<PathBuf>,

    /// TCP ingestion port (0 picks a free port)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// URL to poll, may be repeated
    #[arg(long = "poll", value_name = "URL")]
    poll: Vec<String>,

    /// Interval for URLs given with --poll
    #[arg(long, default_value = "5000")]
    poll_interval_ms: u64,

    /// Forward every entry to this Elasticsearch instance
    #[arg(long)]
    elastic_url: Option<String>,

    #[arg(long)]
    elastic_index: Option<String>,

    /// Only print entries whose message matches, e.g. "error & !timeout"
    #[arg(long)]
    filter: Option<String>,

    /// Default tracing directive when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(port) = self.tcp_port {
            config.tcp.port = port;
        }
        config.http.pollers.extend(self.poll.into_iter().map(|url| PollTarget {
            url,
            interval_ms: self.poll_interval_ms,
            window: None,
        }));
        if let Some(url) = self.elastic_url {
            config.elastic.base_url = url;
            config.elastic.enabled = true;
        }
        if let Some(index) = self.elastic_index {
            config.elastic.index = index;
        }
        if self.filter.is_some() {
            config.filter = self.filter;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_tracing(&config);

    let result = run(config).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(pattern) => MessageFilter::parse(pattern).context("invalid --filter expression")?,
        None => MessageFilter::all(),
    };
    if !filter.is_empty() {
        tracing::info!(filter = filter.pattern(), "Printing only matching entries");
    }

    let hub = Arc::new(DeliveryHub::new(config.delivery.clone()));

    // Headless primary window
    let (window_tx, window_rx) = mpsc::unbounded_channel();
    let window_id = hub.register_window(WindowRole::Primary, Arc::new(window_tx))?;
    let window_task = tokio::spawn(StdoutWindow::new(window_id, hub.clone(), filter).run(window_rx));
    hub.mark_ready(window_id)?;

    let forwarder = if config.elastic.enabled {
        let indexer = BulkIndexer::new(config.elastic.clone()).context("creating Elasticsearch indexer")?;
        tracing::info!(url = %config.elastic.base_url, index = %config.elastic.index, "Forwarding to Elasticsearch");
        Some(Arc::new(ElasticForwarder::spawn(Arc::new(indexer))))
    } else {
        None
    };

    let mut fan_out = FanOut::new().with(hub.clone());
    if let Some(forwarder) = &forwarder {
        fan_out = fan_out.with(forwarder.clone());
    }
    let sink: Arc<dyn EntrySink> = Arc::new(fan_out);

    let cancel = CancellationToken::new();
    let flush_timer = hub.spawn_flush_timer(cancel.child_token());

    let mut server = TcpIngestServer::new(config.tcp.clone(), sink.clone());
    match server.start(config.tcp.port).await {
        Ok(port) => hub.broadcast_status(ServerStatus::running(port)),
        Err(e) => {
            hub.broadcast_status(ServerStatus::failed(e.to_string()));
            return Err(e).context("starting TCP server");
        }
    }

    let pollers = PollerPool::new(config.http.poller.clone(), sink.clone())?;
    for target in &config.http.pollers {
        let id = pollers
            .start_poll(&target.url, target.interval(), target.route())
            .with_context(|| format!("polling {}", target.url))?;
        tracing::info!(%id, url = %target.url, "Started poller");
    }

    if let Some(query) = &config.elastic.query {
        run_startup_query(&config, query, hub.as_ref()).await;
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    let stopped = pollers.stop_all().await;
    tracing::debug!(stopped, "Pollers stopped");
    let status = server.stop().await;
    hub.broadcast_status(status);

    cancel.cancel();
    if let Err(e) = flush_timer.await {
        tracing::warn!("Flush timer task failed: {}", e);
    }

    let report = hub.drain_ready();
    tracing::debug!(batches = report.batches, entries = report.entries, "Final flush");
    hub.close_window(window_id);
    if let Err(e) = window_task.await {
        tracing::warn!("Window task failed: {}", e);
    }

    if let Some(forwarder) = forwarder {
        forwarder.shutdown().await;
        if forwarder.dropped() > 0 {
            tracing::warn!(dropped = forwarder.dropped(), "Entries dropped before reaching Elasticsearch");
        }
    }

    Ok(())
}

/// Deliver the results of the configured query once, without re-indexing them
async fn run_startup_query(config: &AppConfig, query: &str, sink: &dyn EntrySink) {
    let source = match ElasticSource::new(config.elastic.clone()) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!("Elasticsearch source unavailable: {}", e);
            return;
        }
    };

    match source.search(query, config.elastic.search_size).await {
        Ok(entries) => {
            tracing::info!(count = entries.len(), query, "Loaded entries from Elasticsearch");
            sink.accept_batch(entries, Route::Primary);
        }
        Err(e) => sink.accept(
            Normalizer::error_entry(&source.source_name(), format!("Elasticsearch query failed: {e}")),
            Route::Primary,
        ),
    }
}
