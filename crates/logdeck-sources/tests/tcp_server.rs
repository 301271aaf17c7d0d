use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use logdeck_sources::{SourceError, TcpIngestServer, TcpServerConfig};
use logdeck_types::testing::MemorySink;
use logdeck_types::{LogLevel, Route, WindowId};

fn local_config() -> TcpServerConfig {
    TcpServerConfig {
        bind_address: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

async fn start(config: TcpServerConfig) -> (TcpIngestServer, Arc<MemorySink>, u16) {
    let sink = Arc::new(MemorySink::new());
    let mut server = TcpIngestServer::new(config, sink.clone());
    let port = server.start(0).await.expect("server starts");
    (server, sink, port)
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_json_line_becomes_error_entry() {
    let (mut server, sink, port) = start(local_config()).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"{\"level\":\"ERROR\",\"message\":\"boom\"}\n")
        .await
        .unwrap();

    assert!(wait_for(|| sink.len() == 1).await);
    let routed = sink.routed();
    let (entry, route) = &routed[0];
    assert_eq!(entry.level, "ERROR");
    assert_eq!(entry.message, "boom");
    assert!(entry.source.starts_with("tcp:127.0.0.1:"));
    assert_eq!(*route, Route::Primary);

    server.stop().await;
}

#[tokio::test]
async fn test_lines_keep_order_across_chunks() {
    let (mut server, sink, port) = start(local_config()).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"first line\nsec").await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"ond line\r\n\nWARN: third\n").await.unwrap();

    assert!(wait_for(|| sink.len() == 3).await);
    let messages: Vec<String> = sink.entries().into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["first line", "second line", "WARN: third"]);
    assert_eq!(sink.entries()[2].level, LogLevel::Warn.as_str());

    server.stop().await;
}

#[tokio::test]
async fn test_trailing_line_emitted_on_close() {
    let (mut server, sink, port) = start(local_config()).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"complete\nno newline").await.unwrap();
    drop(client);

    assert!(wait_for(|| sink.len() == 2).await);
    assert_eq!(sink.entries()[1].message, "no newline");
    assert!(wait_for(|| server.active_connections() == 0).await);

    server.stop().await;
}

#[tokio::test]
async fn test_ephemeral_port_and_status() {
    let (mut server, _sink, port) = start(local_config()).await;
    assert_ne!(port, 0);
    assert_eq!(server.port(), Some(port));

    let status = server.status();
    assert!(status.ok);
    assert_eq!(status.running, Some(true));
    assert_eq!(status.port, Some(port));

    assert!(matches!(
        server.start(0).await,
        Err(SourceError::AlreadyRunning { .. })
    ));

    let stopped = server.stop().await;
    assert_eq!(stopped.running, Some(false));
    assert!(!server.is_running());

    // Second stop is a no-op
    let again = server.stop().await;
    assert!(again.ok);
    assert_eq!(again.running, Some(false));
}

#[tokio::test]
async fn test_address_in_use_is_reported() {
    let (mut first, _sink, port) = start(local_config()).await;

    let mut second = TcpIngestServer::new(local_config(), Arc::new(MemorySink::new()));
    let err = second.start(port).await.unwrap_err();
    assert!(matches!(err, SourceError::AddressInUse { port: p } if p == port));
    assert!(!second.is_running());

    first.stop().await;
}

#[tokio::test]
async fn test_connection_cap_refuses_extra_client() {
    let config = TcpServerConfig {
        max_connections: 20,
        ..local_config()
    };
    let (mut server, sink, port) = start(config).await;

    let mut clients = Vec::new();
    for _ in 0..20 {
        clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    }
    assert!(wait_for(|| server.active_connections() == 20).await);

    let mut extra = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(wait_for(|| server.rejected_connections() == 1).await);

    // The refused socket is closed by the server
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), extra.read(&mut buf))
        .await
        .expect("refused socket closes");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.active_connections(), 20);

    // Admitted clients still work
    clients[0].write_all(b"still here\n").await.unwrap();
    assert!(wait_for(|| sink.len() == 1).await);

    drop(clients);
    assert!(wait_for(|| server.active_connections() == 0).await);
    server.stop().await;
}

#[tokio::test]
async fn test_default_cap_admits_1000_and_refuses_the_next() {
    let config = TcpServerConfig {
        max_connections: 1000,
        ..local_config()
    };
    let (mut server, _sink, port) = start(config).await;

    let mut clients = Vec::with_capacity(1001);
    for _ in 0..1001 {
        clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    }

    assert!(wait_for(|| server.active_connections() == 1000 && server.rejected_connections() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.active_connections(), 1000);
    assert_eq!(server.rejected_connections(), 1);

    drop(clients);
    assert!(wait_for(|| server.active_connections() == 0).await);
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_line_resets_connection() {
    let config = TcpServerConfig {
        max_line_bytes: 64,
        ..local_config()
    };
    let (mut server, sink, port) = start(config).await;

    let mut noisy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut quiet = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    noisy.write_all(b"ok\n").await.unwrap();
    noisy.write_all(&[b'x'; 200]).await.unwrap();

    assert!(wait_for(|| sink.entries().iter().any(|e| e.level == "ERROR")).await);
    let entries = sink.entries();
    assert_eq!(entries[0].message, "ok");
    assert!(entries[1].message.contains("reset"));
    assert!(wait_for(|| server.active_connections() == 1).await);

    // The offending peer sees an abortive close, not a clean EOF
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), noisy.read(&mut buf))
        .await
        .expect("reset arrives");
    assert_eq!(read.unwrap_err().kind(), std::io::ErrorKind::ConnectionReset);

    quiet.write_all(b"unaffected\n").await.unwrap();
    assert!(wait_for(|| sink.entries().iter().any(|e| e.message == "unaffected")).await);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = TcpServerConfig {
        idle_timeout_ms: 100,
        ..local_config()
    };
    let (mut server, _sink, port) = start(config).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(wait_for(|| server.active_connections() == 1).await);
    assert!(wait_for(|| server.active_connections() == 0).await);

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("idle socket closes");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let (mut server, _sink, port) = start(local_config()).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(wait_for(|| server.active_connections() == 1).await);

    server.stop().await;
    assert_eq!(server.active_connections(), 0);

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("socket closes on stop");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_window_affinity_route() {
    let config = TcpServerConfig {
        window: Some(WindowId(2)),
        ..local_config()
    };
    let (mut server, sink, port) = start(config).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"scoped\n").await.unwrap();

    assert!(wait_for(|| sink.len() == 1).await);
    assert_eq!(sink.routed()[0].1, Route::Window(WindowId(2)));

    server.stop().await;
}
