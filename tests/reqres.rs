#![cfg(feature = "json")]
mod support;

use bytes::Bytes;
use http2::{ConnectionDelegate, Headers, StartLine, Stream, StreamDelegate};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use support::Collector;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Serialize)]
struct CreateUser {
    name: String,
    job: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateUserResponse {
    name: String,
    job: String,
    id: String,
    #[serde(rename = "createdAt")]
    created_at: String,
}

/// A server delegate that parses a `CreateUser` JSON body and echoes it back
/// with a synthesized id and timestamp, the way a "create user" endpoint
/// would -- without reaching any real service.
struct CreateUserEcho;

impl ConnectionDelegate for CreateUserEcho {
    fn start_request(&self, stream: Arc<Stream>) -> Arc<dyn StreamDelegate> {
        Arc::new(CreateUserStream { stream, body: Mutex::new(Vec::new()) })
    }
    fn on_close(&self) {}
}

struct CreateUserStream {
    stream: Arc<Stream>,
    body: Mutex<Vec<u8>>,
}

impl StreamDelegate for CreateUserStream {
    fn headers_received(&self, _start_line: StartLine, _headers: Headers) {}

    fn data_received(&self, chunk: Bytes) -> Option<oneshot::Receiver<()>> {
        self.body.lock().unwrap().extend_from_slice(&chunk);
        None
    }

    fn finish(&self) {
        let request: CreateUser = serde_json::from_slice(&self.body.lock().unwrap()).expect("valid JSON body");
        let response = CreateUserResponse {
            name: request.name,
            job: request.job,
            id: "42".to_owned(),
            created_at: "2026-07-29T00:00:00.000Z".to_owned(),
        };
        let stream = self.stream.clone();
        tokio::spawn(async move {
            let body = Bytes::from(serde_json::to_vec(&response).unwrap());
            let headers = vec![("content-type".to_owned(), "application/json".to_owned())];
            let start_line = StartLine::Response { code: 201, reason: String::new() };
            if stream.write_headers(start_line, headers, Some(body)).await.is_ok() {
                let _ = stream.finish().await;
            }
        });
    }

    fn on_connection_close(&self) {}
}

#[tokio::test]
async fn create_user() {
    let shared = support::connect(Arc::new(CreateUserEcho)).await;

    let collector = Collector::new();
    let stream = shared.open_stream(collector.clone());
    let body = Bytes::from(serde_json::to_vec(&CreateUser { name: "morpheus".to_owned(), job: "leader".to_owned() }).unwrap());
    stream
        .write_headers(
            StartLine::Request { method: "POST".into(), path: "/api/users/".into() },
            vec![(":authority".into(), "example.com".into()), ("content-type".into(), "application/json".into())],
            Some(body),
        )
        .await
        .unwrap();
    stream.finish().await.unwrap();

    timeout(Duration::from_secs(1), stream.wait_finished()).await.unwrap();
    assert_eq!(collector.status(), Some(201));

    let data: CreateUserResponse = serde_json::from_slice(&collector.body()).unwrap();
    assert_eq!(data.name, "morpheus");
    assert_eq!(data.job, "leader");
    assert!(collector.is_finished());
}
