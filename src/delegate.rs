//! The application-facing seam: what the engine calls out to once frames
//! have been decoded into an abstract request/response model.
//! https://httpwg.org/specs/rfc7540.html#HttpSequence

use crate::stream::Stream;
use crate::types::Headers;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The request or response line a HEADERS block decodes to, depending on
/// which side of the connection this stream is on.
#[derive(Debug, Clone)]
pub enum StartLine {
    Request { method: String, path: String },
    Response { code: u16, reason: String },
}

/// Per-connection callbacks.
pub trait ConnectionDelegate: Send + Sync {
    /// A server received HEADERS opening a new stream. `stream` is already
    /// registered with the connection, so the returned delegate can hold
    /// onto it to write a response once it has one.
    fn start_request(&self, stream: Arc<Stream>) -> Arc<dyn StreamDelegate>;

    /// The connection's dispatch loop has exited, for any reason.
    fn on_close(&self);
}

/// Per-stream callbacks. `data_received`'s return value is a backpressure
/// signal: when `Some`, the engine defers the stream's and connection's
/// WINDOW_UPDATE for this chunk until the receiver fires.
pub trait StreamDelegate: Send + Sync {
    fn headers_received(&self, start_line: StartLine, headers: Headers);
    fn data_received(&self, chunk: Bytes) -> Option<oneshot::Receiver<()>>;
    fn finish(&self);
    fn on_connection_close(&self);
}
