mod support;

use bytes::Bytes;
use http2::StartLine;
use std::sync::Arc;
use support::{Collector, Route, Router};
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn get_hello() {
    let router = Arc::new(Router {
        routes: vec![Route { path: "/hello", status: 200, headers: Vec::new(), body: Bytes::from_static(b"hello world") }],
    });
    let shared = support::connect(router).await;

    let collector = Collector::new();
    let stream = shared.open_stream(collector.clone());
    stream
        .write_headers(
            StartLine::Request { method: "GET".into(), path: "/hello".into() },
            vec![(":authority".into(), "example.com".into())],
            None,
        )
        .await
        .unwrap();
    stream.finish().await.unwrap();

    timeout(Duration::from_secs(1), stream.wait_finished()).await.unwrap();
    assert_eq!(collector.status(), Some(200));
    assert_eq!(collector.body(), b"hello world");
}

#[tokio::test]
async fn get_unmapped_path_is_404() {
    let router = Arc::new(Router { routes: Vec::new() });
    let shared = support::connect(router).await;

    let collector = Collector::new();
    let stream = shared.open_stream(collector.clone());
    stream
        .write_headers(
            StartLine::Request { method: "GET".into(), path: "/missing".into() },
            vec![(":authority".into(), "example.com".into())],
            None,
        )
        .await
        .unwrap();
    stream.finish().await.unwrap();

    timeout(Duration::from_secs(1), stream.wait_finished()).await.unwrap();
    assert_eq!(collector.status(), Some(404));
}

/// Two streams multiplexed over the same connection: a request for a moved
/// path returns a 3xx with `location`, which the test follows manually on a
/// second stream over the same handle.
#[tokio::test]
async fn redirect_then_follow_on_same_connection() {
    let router = Arc::new(Router {
        routes: vec![
            Route { path: "/old", status: 301, headers: vec![("location".into(), "/new".into())], body: Bytes::new() },
            Route { path: "/new", status: 200, headers: Vec::new(), body: Bytes::from_static(b"moved here") },
        ],
    });
    let shared = support::connect(router).await;

    let first = Collector::new();
    let stream = shared.open_stream(first.clone());
    stream
        .write_headers(StartLine::Request { method: "GET".into(), path: "/old".into() }, vec![(":authority".into(), "example.com".into())], None)
        .await
        .unwrap();
    stream.finish().await.unwrap();
    timeout(Duration::from_secs(1), stream.wait_finished()).await.unwrap();
    assert_eq!(first.status(), Some(301));
    let location = first.header("location").unwrap();

    let second = Collector::new();
    let stream = shared.open_stream(second.clone());
    stream
        .write_headers(StartLine::Request { method: "GET".into(), path: location }, vec![(":authority".into(), "example.com".into())], None)
        .await
        .unwrap();
    stream.finish().await.unwrap();
    timeout(Duration::from_secs(1), stream.wait_finished()).await.unwrap();
    assert_eq!(second.status(), Some(200));
    assert_eq!(second.body(), b"moved here");
}
