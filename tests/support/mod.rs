//! Shared hermetic test scaffolding: an in-memory duplex transport standing
//! in for TLS/TCP, a request router playing the server role, and a delegate
//! that records what a stream receives so tests can assert on it.
#![allow(dead_code)]

use bytes::Bytes;
use http2::{BoxedTransport, Connection, ConnectionDelegate, Headers, Params, Role, StartLine, Stream, StreamDelegate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub fn duplex_pair(capacity: usize) -> (BoxedTransport, BoxedTransport) {
    let (a, b) = tokio::io::duplex(capacity);
    (Box::new(a), Box::new(b))
}

/// Handshakes a client and server connection over an in-memory pipe, spawns
/// both dispatch loops, and returns a handle for opening client streams.
pub async fn connect(server_delegate: Arc<dyn ConnectionDelegate>) -> Arc<http2::connection::Shared> {
    let (client_io, server_io) = duplex_pair(1 << 16);
    let client = Connection::handshake(client_io, Role::Client, Params::default(), None)
        .await
        .unwrap()
        .unwrap();
    let server = Connection::handshake(server_io, Role::Server, Params::default(), Some(server_delegate))
        .await
        .unwrap()
        .unwrap();
    let shared = client.handle();
    tokio::spawn(client.run());
    tokio::spawn(server.run());
    shared
}

/// Collects one stream's inbound start line, headers, and body.
pub struct Collector {
    start_line: Mutex<Option<StartLine>>,
    headers: Mutex<Headers>,
    body: Mutex<Vec<u8>>,
    finished: AtomicBool,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_line: Mutex::new(None),
            headers: Mutex::new(Vec::new()),
            body: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> Option<u16> {
        match &*self.start_line.lock().unwrap() {
            Some(StartLine::Response { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.lock().unwrap().iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl StreamDelegate for Collector {
    fn headers_received(&self, start_line: StartLine, headers: Headers) {
        *self.start_line.lock().unwrap() = Some(start_line);
        *self.headers.lock().unwrap() = headers;
    }

    fn data_received(&self, chunk: Bytes) -> Option<oneshot::Receiver<()>> {
        self.body.lock().unwrap().extend_from_slice(&chunk);
        None
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn on_connection_close(&self) {}
}

/// A fixed response to serve for one exact `:path`.
#[derive(Clone)]
pub struct Route {
    pub path: &'static str,
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// A server-side connection delegate that answers each request by matching
/// its `:path` against a fixed route table, falling back to 404.
pub struct Router {
    pub routes: Vec<Route>,
}

impl ConnectionDelegate for Router {
    fn start_request(&self, stream: Arc<Stream>) -> Arc<dyn StreamDelegate> {
        Arc::new(RouteDispatch { stream, routes: self.routes.clone(), path: Mutex::new(None) })
    }

    fn on_close(&self) {}
}

struct RouteDispatch {
    stream: Arc<Stream>,
    routes: Vec<Route>,
    path: Mutex<Option<String>>,
}

impl StreamDelegate for RouteDispatch {
    fn headers_received(&self, start_line: StartLine, _headers: Headers) {
        if let StartLine::Request { path, .. } = start_line {
            *self.path.lock().unwrap() = Some(path);
        }
    }

    fn data_received(&self, _chunk: Bytes) -> Option<oneshot::Receiver<()>> {
        None
    }

    fn finish(&self) {
        let path = self.path.lock().unwrap().clone().unwrap_or_default();
        let route = self.routes.iter().find(|r| r.path == path).cloned();
        let stream = self.stream.clone();
        tokio::spawn(async move {
            let (status, headers, body) = match route {
                Some(r) => (r.status, r.headers, r.body),
                None => (404, Vec::new(), Bytes::new()),
            };
            let start_line = StartLine::Response { code: status, reason: String::new() };
            if stream.write_headers(start_line, headers, Some(body)).await.is_ok() {
                let _ = stream.finish().await;
            }
        });
    }

    fn on_connection_close(&self) {}
}
