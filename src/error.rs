//! Error types split along the same line tornado_http2 draws: a
//! `ConnectionError` tears down the whole connection, a `StreamError` only
//! the stream that raised it.

use crate::types::{ErrorCode, StreamId};
use thiserror::Error;

/// A protocol-level error which shuts down the entire connection.
#[derive(Error, Debug, Clone)]
#[error("connection error {code:?}: {}", message.as_deref().unwrap_or("none"))]
pub struct ConnectionError {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl ConnectionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// An error which terminates a single stream but leaves the connection intact.
#[derive(Error, Debug, Clone, Copy)]
#[error("stream {stream_id} error {code:?}")]
pub struct StreamError {
    pub stream_id: StreamId,
    pub code: ErrorCode,
}

impl StreamError {
    pub fn new(stream_id: StreamId, code: ErrorCode) -> Self {
        Self { stream_id, code }
    }
}

/// Either flavor of protocol error, as produced by per-frame handling before
/// it is known which scope it belongs to.
#[derive(Error, Debug, Clone)]
pub enum H2Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Failure writing frames to the transport, always connection-fatal.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
}
