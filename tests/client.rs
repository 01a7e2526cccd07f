mod support;

use bytes::Bytes;
use http2::StartLine;
use std::sync::Arc;
use support::{Collector, Route, Router};
use tokio::time::{timeout, Duration};

/// A response body larger than the default 65,535-byte flow-control window
/// forces the client to send WINDOW_UPDATE frames mid-stream for the
/// response to complete at all.
#[tokio::test]
async fn large_response_spans_multiple_flow_control_windows() {
    let body = Bytes::from(vec![b'x'; 200 * 1024]);
    let router = Arc::new(Router {
        routes: vec![Route { path: "/big", status: 200, headers: Vec::new(), body: body.clone() }],
    });
    let shared = support::connect(router).await;

    let collector = Collector::new();
    let stream = shared.open_stream(collector.clone());
    stream
        .write_headers(
            StartLine::Request { method: "GET".into(), path: "/big".into() },
            vec![(":authority".into(), "example.com".into())],
            None,
        )
        .await
        .unwrap();
    stream.finish().await.unwrap();

    timeout(Duration::from_secs(5), stream.wait_finished()).await.unwrap();
    assert_eq!(collector.status(), Some(200));
    assert_eq!(collector.body().len(), body.len());
    assert_eq!(collector.body(), body.to_vec());
}

#[tokio::test]
async fn concurrent_streams_on_one_connection_do_not_cross_talk() {
    let router = Arc::new(Router {
        routes: vec![
            Route { path: "/a", status: 200, headers: Vec::new(), body: Bytes::from_static(b"alpha") },
            Route { path: "/b", status: 200, headers: Vec::new(), body: Bytes::from_static(b"bravo") },
        ],
    });
    let shared = support::connect(router).await;

    let a = Collector::new();
    let stream_a = shared.open_stream(a.clone());
    let b = Collector::new();
    let stream_b = shared.open_stream(b.clone());

    stream_a
        .write_headers(StartLine::Request { method: "GET".into(), path: "/a".into() }, vec![(":authority".into(), "example.com".into())], None)
        .await
        .unwrap();
    stream_b
        .write_headers(StartLine::Request { method: "GET".into(), path: "/b".into() }, vec![(":authority".into(), "example.com".into())], None)
        .await
        .unwrap();
    stream_a.finish().await.unwrap();
    stream_b.finish().await.unwrap();

    timeout(Duration::from_secs(1), stream_a.wait_finished()).await.unwrap();
    timeout(Duration::from_secs(1), stream_b.wait_finished()).await.unwrap();

    assert_eq!(a.body(), b"alpha");
    assert_eq!(b.body(), b"bravo");
}
