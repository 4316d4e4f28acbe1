//! End-to-end tests for the coalescing node.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use flock_core::CoalescePolicy;
use flock_node::api::{create_router, AppState, GREETED_AT_HEADER, GREETING};
use flock_node::config::Config;
use futures::future::join_all;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

fn node(policy: CoalescePolicy, greet_delay_ms: u64) -> (Router, AppState) {
    let mut config = Config::default();
    config.demo.greet_delay_ms = greet_delay_ms;
    let state = AppState::new(&config);
    let router = create_router(state.clone(), policy, &config.server);
    (router, state)
}

struct Reply {
    status: StatusCode,
    greeted_at: Option<String>,
    request_id: Option<String>,
    body: String,
}

async fn get(app: Router, uri: &str, headers: &[(&str, &str)]) -> Reply {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let response = app
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let (greeted_at, request_id) = {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .map(|v| v.to_str().unwrap().to_string())
        };
        (header(GREETED_AT_HEADER.as_str()), header("x-request-id"))
    };
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    Reply {
        status,
        greeted_at,
        request_id,
        body: String::from_utf8(body.to_vec()).unwrap(),
    }
}

async fn burst(app: &Router, uri: &str, headers: &[(&str, &str)], n: usize) -> Vec<Reply> {
    let tasks: Vec<_> = (0..n)
        .map(|_| {
            let app = app.clone();
            let uri = uri.to_string();
            let headers: Vec<(String, String)> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            tokio::spawn(async move {
                let headers: Vec<(&str, &str)> = headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                get(app, &uri, &headers).await
            })
        })
        .collect();

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_run_handler_once() {
    let (app, state) = node(CoalescePolicy::header("abc", "abcabc"), 300);

    let replies = burst(&app, "/single", &[("abc", "abcabc")], 10).await;

    assert_eq!(state.greetings(), 1);
    for reply in &replies {
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, GREETING);
        assert_eq!(reply.greeted_at, replies[0].greeted_at);
    }

    // Every caller keeps its own request id even when served a replay.
    let mut ids: Vec<_> = replies.iter().filter_map(|r| r.request_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);

    let stats = state.group.stats();
    assert_eq!(stats.total_requests, 10);
    assert_eq!(stats.new_fetches, 1);
    assert_eq!(stats.coalesced_requests, 9);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_header_is_not_coalesced() {
    let (app, state) = node(CoalescePolicy::header("abc", "abcabc1"), 50);

    let replies = burst(&app, "/single", &[("abc", "abcabc")], 10).await;

    assert_eq!(state.greetings(), 10);
    assert!(replies.iter().all(|r| r.body == GREETING));
    assert_eq!(state.group.stats().bypassed_requests, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_original_route_is_never_coalesced() {
    let (app, state) = node(CoalescePolicy::header("abc", "abcabc"), 50);

    burst(&app, "/original", &[("abc", "abcabc")], 10).await;

    assert_eq!(state.greetings(), 10);
    assert_eq!(state.group.stats().total_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_requests_each_run_handler() {
    let (app, state) = node(CoalescePolicy::header("abc", "abcabc"), 0);

    for _ in 0..3 {
        let reply = get(app.clone(), "/single", &[("abc", "abcabc")]).await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    assert_eq!(state.greetings(), 3);
    let count = get(app, "/count", &[]).await;
    assert_eq!(count.body, "3\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metrics_report_coalescing() {
    let (app, _state) = node(CoalescePolicy::header("abc", "abcabc"), 300);

    burst(&app, "/single", &[("abc", "abcabc")], 5).await;

    let metrics = get(app, "/metrics", &[]).await;
    assert_eq!(metrics.status, StatusCode::OK);
    assert!(metrics
        .body
        .contains("flock_coalesce_requests_total{outcome=\"follower\"} 4"));
    assert!(metrics
        .body
        .contains("flock_coalesce_requests_total{outcome=\"leader\"} 1"));
    assert!(metrics.body.contains("path=\"/single\""));
}

#[tokio::test]
async fn test_server_serves_and_shuts_down() {
    let (app, _state) = node(CoalescePolicy::header("abc", "abcabc"), 0);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(flock_node::server::run(
        listener,
        app,
        Duration::from_secs(1),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK"));
    assert!(raw.contains("\"status\":\"ok\""));

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
