use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use logdeck_sources::{Poller, PollerConfig, PollerPool};
use logdeck_types::testing::MemorySink;
use logdeck_types::{EntrySink, Route};

const TWO_ENTRIES: &str = r#"[
    {"timestamp":"2024-05-01T10:00:00Z","level":"INFO","message":"started"},
    {"timestamp":"2024-05-01T10:00:01Z","level":"WARN","message":"slow request"}
]"#;

fn poller(server: &MockServer, route_path: &str, config: PollerConfig, sink: Arc<MemorySink>) -> Poller {
    let url = Url::parse(&format!("{}{}", server.uri(), route_path)).unwrap();
    let sink: Arc<dyn EntrySink> = sink;
    Poller::new(Client::new(), url, Arc::new(config), sink, Route::Primary)
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_repeated_identical_body_yields_nothing_new() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TWO_ENTRIES))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/logs", PollerConfig::default(), sink.clone());

    assert_eq!(poller.tick().await, 2);
    assert_eq!(poller.tick().await, 0);
    assert_eq!(sink.len(), 2);
    assert_eq!(poller.seen().len(), 2);

    let entries = sink.entries();
    assert_eq!(entries[1].level, "WARN");
    assert_eq!(entries[1].source, format!("{}/logs", server.uri()));
}

#[tokio::test]
async fn test_only_new_entries_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TWO_ENTRIES))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"logs":[
                {"timestamp":"2024-05-01T10:00:01Z","level":"WARN","message":"slow request"},
                {"timestamp":"2024-05-01T10:00:02Z","level":"ERROR","message":"failed"}
            ]}"#,
        ))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/logs", PollerConfig::default(), sink.clone());

    assert_eq!(poller.tick().await, 2);
    assert_eq!(poller.tick().await, 1);
    assert_eq!(sink.entries()[2].message, "failed");
}

#[tokio::test]
async fn test_text_body_is_split_into_lines() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plain"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("2024-05-01T10:00:00Z [ERROR] disk full\nplain line\n"),
        )
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/plain", PollerConfig::default(), sink.clone());

    assert_eq!(poller.tick().await, 2);
    let entries = sink.entries();
    assert_eq!(entries[0].level, "ERROR");
    assert!(entries[0].timestamp.is_some());
    assert_eq!(entries[1].message, "plain line");
}

#[tokio::test]
async fn test_non_success_status_emits_one_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/logs", PollerConfig::default(), sink.clone());

    assert_eq!(poller.tick().await, 0);
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, "ERROR");
    assert!(entries[0].message.contains("503"));
}

#[tokio::test]
async fn test_oversized_response_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let config = PollerConfig {
        max_response_bytes: 1024,
        ..Default::default()
    };
    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/big", config, sink.clone());

    assert_eq!(poller.tick().await, 0);
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, "ERROR");
    assert!(entries[0].message.contains("1024"));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(TWO_ENTRIES)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = PollerConfig {
        timeout_ms: 100,
        ..Default::default()
    };
    let sink = Arc::new(MemorySink::new());
    let mut poller = poller(&server, "/slow", config, sink.clone());

    let started = Instant::now();
    assert_eq!(poller.tick().await, 0);
    assert!(started.elapsed() < Duration::from_secs(2));

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].message.contains("timed out"));
}

#[tokio::test]
async fn test_pool_polls_and_stops() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TWO_ENTRIES))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let pool = PollerPool::new(PollerConfig::default(), sink.clone()).unwrap();

    let url = format!("{}/logs", server.uri());
    let id = pool.start_poll(&url, Duration::from_millis(10), Route::Primary).unwrap();

    let active = pool.active_pollers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].interval, Duration::from_millis(500));

    // First fetch happens immediately
    assert!(wait_for(|| sink.len() == 2).await);

    assert!(pool.stop_poll(id).await);
    assert!(!pool.stop_poll(id).await);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_no_emission_after_stop_with_fetch_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(TWO_ENTRIES)
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let pool = PollerPool::new(PollerConfig::default(), sink.clone()).unwrap();
    let id = pool
        .start_poll(&format!("{}/logs", server.uri()), Duration::from_secs(1), Route::Primary)
        .unwrap();

    // Let the request reach the server, then stop while it is pending
    for _ in 0..100 {
        if server.received_requests().await.is_some_and(|r| !r.is_empty()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    assert!(pool.stop_poll(id).await);
    assert!(started.elapsed() < Duration::from_millis(400));

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_stop_all_and_invalid_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let pool = PollerPool::new(PollerConfig::default(), sink.clone()).unwrap();

    assert!(pool.start_poll("file:///etc/passwd", Duration::from_secs(1), Route::Primary).is_err());

    for name in ["a", "b", "c"] {
        pool.start_poll(&format!("{}/{name}", server.uri()), Duration::from_secs(1), Route::Broadcast)
            .unwrap();
    }
    assert_eq!(pool.len(), 3);

    assert_eq!(pool.stop_all().await, 3);
    assert!(pool.active_pollers().is_empty());
    assert!(sink.is_empty());
}
