//! A minimal client: TLS connect with ALPN `h2`, run the connection's
//! dispatch loop on a background task, open one stream per request, and
//! collect its response.

use crate::config::Params;
use crate::connection::{Connection, Role};
use crate::delegate::{StartLine, StreamDelegate};
use crate::request::Request;
use crate::response::Response;
use crate::transport::{default_client_tls_config, BoxedTransport};
use crate::types::Headers;
use anyhow::anyhow;
use bytes::Bytes;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::{rustls, TlsConnector};
use url::Url;

pub struct Client {
    tls_config: Arc<rustls::ClientConfig>,
}

impl Client {
    pub async fn request(&self, request: Request) -> anyhow::Result<Response> {
        let host = request.url.host_str().ok_or_else(|| anyhow!("URL has no host"))?.to_owned();
        let port = request.url.port_or_known_default().ok_or_else(|| anyhow!("no port for URL"))?;
        trace!("connecting to {host}:{port}");

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let domain = rustls::ServerName::try_from(host.as_str())?;
        let tls = TlsConnector::from(self.tls_config.clone()).connect(domain, tcp).await?;
        let transport: BoxedTransport = Box::new(tls);

        let connection = Connection::handshake(transport, Role::Client, Params::default(), None)
            .await?
            .ok_or_else(|| anyhow!("peer rejected the client connection preface"))?;
        let shared = connection.handle();
        tokio::spawn(async move {
            if let Err(err) = connection.run().await {
                debug!("connection loop ended: {err}");
            }
        });

        let collector = ResponseCollector::new();
        let stream = shared.open_stream(collector.clone());
        stream
            .write_headers(request.start_line(), request.header_list(), Some(request.body.clone()))
            .await?;
        stream.finish().await?;
        stream.wait_finished().await;

        if collector.closed_early.load(Ordering::SeqCst) {
            return Err(anyhow!("connection closed before the response completed"));
        }
        Ok(collector.into_response())
    }

    #[inline]
    pub async fn get(&self, url: Url) -> anyhow::Result<Response> {
        self.request(Request::get(url, None)).await
    }

    #[inline]
    pub async fn post(&self, url: Url, body: impl Into<Bytes>) -> anyhow::Result<Response> {
        self.request(Request::post(url, None, body)).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self {
            tls_config: default_client_tls_config(),
        }
    }
}

/// Accumulates one client stream's headers and body until `finish`, then
/// hands them to whoever is awaiting `Stream::wait_finished`.
struct ResponseCollector {
    status: Mutex<u16>,
    headers: Mutex<Headers>,
    body: Mutex<Vec<u8>>,
    closed_early: AtomicBool,
}

impl ResponseCollector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(0),
            headers: Mutex::new(Vec::new()),
            body: Mutex::new(Vec::new()),
            closed_early: AtomicBool::new(false),
        })
    }

    fn into_response(&self) -> Response {
        Response {
            status: *self.status.lock().unwrap(),
            headers: self.headers.lock().unwrap().clone(),
            body: Bytes::from(self.body.lock().unwrap().clone()),
        }
    }
}

impl StreamDelegate for ResponseCollector {
    fn headers_received(&self, start_line: StartLine, headers: Headers) {
        if let StartLine::Response { code, .. } = start_line {
            *self.status.lock().unwrap() = code;
        }
        *self.headers.lock().unwrap() = headers;
    }

    fn data_received(&self, chunk: Bytes) -> Option<oneshot::Receiver<()>> {
        self.body.lock().unwrap().extend_from_slice(&chunk);
        None
    }

    fn finish(&self) {}

    fn on_connection_close(&self) {
        self.closed_early.store(true, Ordering::SeqCst);
    }
}
