//! Newline-delimited TCP ingestion server.
//!
//! Each accepted socket gets its own task that frames lines, normalizes
//! them and hands them to the [`EntrySink`]. Admission is capped by
//! `max_connections`; idle sockets are closed and sockets whose
//! unterminated line grows past `max_line_bytes` are reset (RST).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use logdeck_types::{EntrySink, LogEntry, Route, ServerStatus, WindowId};

use crate::connections::{ConnectionGuard, ConnectionRegistry};
use crate::error::SourceError;
use crate::framing::LineSplitter;
use crate::normalize::Normalizer;

/// Pause after a failed `accept` so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// TCP ingestion server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    /// Interface to bind
    pub bind_address: String,

    /// Port used when the caller does not pass one explicitly
    pub port: u16,

    /// Hard ceiling on concurrently open connections
    pub max_connections: usize,

    /// Sockets without traffic for this long are closed
    pub idle_timeout_ms: u64,

    /// Ceiling for one unterminated line
    pub max_line_bytes: usize,

    /// Initial read buffer per connection
    pub read_buffer_bytes: usize,

    /// Deliver only to this window instead of the primary one
    pub window: Option<WindowId>,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 4560,
            max_connections: 1000,
            idle_timeout_ms: 5 * 60 * 1000,
            max_line_bytes: 1024 * 1024,
            read_buffer_bytes: 16 * 1024,
            window: None,
        }
    }
}

impl TcpServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn route(&self) -> Route {
        Route::from(self.window)
    }
}

/// Everything a connection task needs, shared by all of them
struct ConnectionContext {
    config: TcpServerConfig,
    sink: Arc<dyn EntrySink>,
    connections: ConnectionRegistry,
}

struct RunningServer {
    port: u16,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// TCP server accepting newline-delimited log payloads
pub struct TcpIngestServer {
    context: Arc<ConnectionContext>,
    running: Option<RunningServer>,
}

impl TcpIngestServer {
    pub fn new(config: TcpServerConfig, sink: Arc<dyn EntrySink>) -> Self {
        Self {
            context: Arc::new(ConnectionContext {
                config,
                sink,
                connections: ConnectionRegistry::new(),
            }),
            running: None,
        }
    }

    /// Bind the listener and start accepting.
    ///
    /// Returns the bound port (useful with port 0). Bind failures are
    /// returned here and leave the server stopped.
    pub async fn start(&mut self, port: u16) -> Result<u16, SourceError> {
        if let Some(running) = &self.running {
            return Err(SourceError::AlreadyRunning { port: running.port });
        }

        let address = format!("{}:{}", self.context.config.bind_address, port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| SourceError::bind(address.clone(), port, e))?;
        let bound_port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            cancel.clone(),
            tracker.clone(),
        ));

        tracing::info!(
            address = %self.context.config.bind_address,
            port = bound_port,
            max_connections = self.context.config.max_connections,
            "TCP ingestion server listening"
        );

        self.running = Some(RunningServer {
            port: bound_port,
            cancel,
            tracker,
        });
        Ok(bound_port)
    }

    /// Close the listener and every open connection. Idempotent.
    pub async fn stop(&mut self) -> ServerStatus {
        let Some(running) = self.running.take() else {
            return ServerStatus::stopped();
        };

        for (id, info) in self.context.connections.snapshot() {
            tracing::debug!(
                connection = id,
                peer = %info.peer,
                bytes = info.bytes_received,
                open_for = ?info.opened_at.elapsed(),
                "Closing connection on shutdown"
            );
        }

        running.cancel.cancel();
        running.tracker.close();
        running.tracker.wait().await;

        tracing::info!(port = running.port, "TCP ingestion server stopped");
        ServerStatus::stopped()
    }

    pub fn status(&self) -> ServerStatus {
        match &self.running {
            Some(running) => ServerStatus::running(running.port),
            None => ServerStatus::stopped(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    pub fn active_connections(&self) -> usize {
        self.context.connections.active()
    }

    pub fn rejected_connections(&self) -> u64 {
        self.context.connections.rejected()
    }
}

impl Drop for TcpIngestServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let route = context.config.route();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Some(guard) = context
                        .connections
                        .try_register(peer, context.config.max_connections)
                    else {
                        tracing::warn!(
                            peer = %peer,
                            max_connections = context.config.max_connections,
                            "Connection limit reached, refusing connection"
                        );
                        drop(stream);
                        continue;
                    };

                    tracing::debug!(peer = %peer, connection = guard.id(), "Connection accepted");
                    tracker.spawn(handle_connection(
                        stream,
                        peer,
                        guard,
                        Arc::clone(&context),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    context
                        .sink
                        .accept(LogEntry::error("tcp", format!("TCP accept failed: {e}")), route);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    context: Arc<ConnectionContext>,
    cancel: CancellationToken,
) {
    let config = &context.config;
    let route = config.route();
    let source = format!("tcp:{}:{}", peer.ip(), peer.port());

    let mut splitter = LineSplitter::new(config.max_line_bytes);
    let mut buf = BytesMut::with_capacity(config.read_buffer_bytes);
    let mut lines = Vec::new();

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            read = tokio::time::timeout(config.idle_timeout(), stream.read_buf(&mut buf)) => read,
        };

        match read {
            Err(_) => {
                tracing::info!(peer = %peer, idle = ?config.idle_timeout(), "Closing idle connection");
                break;
            }
            Ok(Ok(0)) => {
                if let Some(line) = splitter.finish() {
                    context.sink.accept(Normalizer::from_line(&line, &source), route);
                }
                tracing::debug!(peer = %peer, "Connection closed by peer");
                break;
            }
            Ok(Ok(n)) => {
                guard.touch(n);
                let framed = splitter.push(&buf, &mut lines);
                buf.clear();

                for line in lines.drain(..) {
                    context.sink.accept(Normalizer::from_line(&line, &source), route);
                }

                if let Err(overflow) = framed {
                    tracing::warn!(peer = %peer, error = %overflow, "Resetting connection on buffer overflow");
                    context.sink.accept(
                        LogEntry::error(
                            source.as_str(),
                            format!("Connection {source} reset: {overflow}"),
                        ),
                        route,
                    );
                    reset(&stream);
                    break;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer, error = %e, "Socket error");
                context.sink.accept(
                    LogEntry::error(source.as_str(), format!("Socket error on {source}: {e}")),
                    route,
                );
                break;
            }
        }
    }

    drop(guard);
}

/// Make the upcoming close abort the connection instead of a graceful FIN
#[allow(deprecated)]
fn reset(stream: &TcpStream) {
    // A zero linger never blocks on close
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %e, "Failed to set linger");
    }
}
