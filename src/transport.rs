//! The byte transport the engine is handed after TLS/ALPN negotiation (or
//! after an HTTP/1.1 Upgrade), and the cleartext-upgrade detection boundary.
//! https://httpwg.org/specs/rfc7540.html#discover-http

use crate::types::CLIENT_PREFACE;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;

/// A full-duplex byte stream, already past negotiation. Anything satisfying
/// tokio's async I/O traits qualifies; the engine performs no TLS or ALPN
/// itself, only framing on top of whatever transport it's handed.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Transport for T {}

/// A transport behind a trait object, so `Connection` does not need to be
/// generic over every concrete stream type a caller might hand it. Tokio's
/// blanket `AsyncRead`/`AsyncWrite` impls for `Box<dyn ... + Unpin>` make this
/// usable directly wherever a `Transport` bound is expected.
pub type BoxedTransport = Box<dyn Transport + Unpin>;

/// Builds the default client TLS configuration: the platform root store via
/// `webpki-roots`, ALPN restricted to `h2`.
pub fn default_client_tls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![crate::types::ALPN_H2.as_bytes().to_vec()];
    Arc::new(config)
}

/// Whether the bytes already read from a fresh, non-TLS connection are (a
/// prefix of) the client connection preface, meaning this transport should be
/// adopted directly in HTTP/2 server role rather than parsed as HTTP/1.1.
/// https://httpwg.org/specs/rfc7540.html#Starting
pub fn looks_like_client_preface(buf: &[u8]) -> bool {
    let n = buf.len().min(CLIENT_PREFACE.len());
    buf[..n] == CLIENT_PREFACE[..n]
}
