//! Per-stream lifecycle: header assembly, pseudo-header validation, content
//! length accounting, and chunked body I/O. https://httpwg.org/specs/rfc7540.html#StreamsLayer
//!
//! Grounded throughout in tornado_http2's `stream.py`; `Stream::handle_frame`
//! mirrors `Stream.handle_frame`, `write_headers`/`write`/`finish` mirror
//! their namesakes.

use crate::connection::Shared;
use crate::delegate::{StartLine, StreamDelegate};
use crate::error::{ConnectionError, H2Error, StreamError};
use crate::flags::{ContinuationFlags, DataFlags, HeadersFlags};
use crate::flow::Window;
use crate::frame::{self, Frame};
use crate::hpack::IndexMode;
use crate::types::{ErrorCode, FrameType, Headers, StreamId, DEFAULT_MAX_FRAME_SIZE};
use bytes::Bytes;
use derivative::Derivative;
use log::{trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Body,
    Trailers,
}

/// Failure writing a response/request body, as surfaced to the application.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("wrote {written} bytes against a content-length of {promised}")]
    ContentLengthOvershoot { written: i64, promised: i64 },
    #[error("finished {remaining} bytes short of the declared content-length")]
    ContentLengthUndershoot { remaining: i64 },
    #[error("connection closed")]
    Closed,
}

impl From<crate::error::OutputError> for WriteError {
    fn from(_: crate::error::OutputError) -> Self {
        WriteError::Closed
    }
}

#[derive(Debug)]
struct IncomingState {
    phase: Phase,
    header_block: Vec<u8>,
    first_header_frame_flags: Option<u8>,
    needs_continuation: bool,
    incoming_content_remaining: Option<i64>,
    delegate_started: bool,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    stream_id: StreamId,
    is_client: bool,
    max_header_size: usize,
    #[derivative(Debug = "ignore")]
    shared: Weak<Shared>,
    #[derivative(Debug = "ignore")]
    window: Arc<Window>,
    incoming: Mutex<IncomingState>,
    write_lock: tokio::sync::Mutex<()>,
    outgoing_content_remaining: Mutex<Option<i64>>,
    request_method: Mutex<Option<String>>,
    #[derivative(Debug = "ignore")]
    delegate: Mutex<Option<Arc<dyn StreamDelegate>>>,
    #[derivative(Debug = "ignore")]
    finished: Notify,
    is_finished: AtomicBool,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        is_client: bool,
        max_header_size: usize,
        shared: Weak<Shared>,
        connection_window: Arc<Window>,
        initial_window_size: i64,
        delegate: Option<Arc<dyn StreamDelegate>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            is_client,
            max_header_size,
            shared,
            window: Window::new(Some(connection_window), Some(stream_id), initial_window_size),
            incoming: Mutex::new(IncomingState {
                phase: Phase::Headers,
                header_block: Vec::new(),
                first_header_frame_flags: None,
                needs_continuation: false,
                incoming_content_remaining: None,
                delegate_started: false,
            }),
            write_lock: tokio::sync::Mutex::new(()),
            outgoing_content_remaining: Mutex::new(None),
            request_method: Mutex::new(None),
            delegate: Mutex::new(delegate),
            finished: Notify::new(),
            is_finished: AtomicBool::new(false),
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn set_delegate(&self, delegate: Arc<dyn StreamDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    pub fn needs_continuation(&self) -> bool {
        self.incoming.lock().unwrap().needs_continuation
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::SeqCst)
    }

    /// Resolves once the stream has reached a terminal state, inbound or
    /// outbound.
    pub async fn wait_finished(&self) {
        loop {
            if self.is_finished() {
                return;
            }
            let notified = self.finished.notified();
            tokio::pin!(notified);
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    fn mark_finished(&self) {
        self.is_finished.store(true, Ordering::SeqCst);
        self.finished.notify_waiters();
    }

    fn delegate(&self) -> Option<Arc<dyn StreamDelegate>> {
        self.delegate.lock().unwrap().clone()
    }

    fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    // -- Inbound -------------------------------------------------------------

    pub async fn handle_frame(&self, frame: &Frame, decoder: &mut crate::hpack::Decoder) -> Result<(), H2Error> {
        trace!("stream {} recv {:?} flags={:#x}", self.stream_id, frame.kind(), frame.flags);
        let kind = match frame.kind() {
            Some(k) => k,
            // Unknown frame types are preserved on the wire but otherwise
            // ignored, per RFC 7540 §4.1.
            None => return Ok(()),
        };

        match kind {
            FrameType::Priority => return self.handle_priority_frame(frame),
            FrameType::ResetStream => return self.handle_rst_stream_frame(frame),
            FrameType::WindowUpdate => return self.window.apply_window_update(&frame.payload),
            FrameType::Settings | FrameType::GoAway | FrameType::PushPromise => {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, format!("{kind:?} is not valid on a stream")).into());
            }
            _ => {}
        }

        if self.is_finished() {
            return Err(StreamError::new(self.stream_id, ErrorCode::StreamClosed).into());
        }

        match kind {
            FrameType::Headers => self.handle_headers_frame(frame, decoder).await,
            FrameType::Continuation => self.handle_continuation_frame(frame, decoder).await,
            FrameType::Data => self.handle_data_frame(frame).await,
            _ => Ok(()),
        }
    }

    async fn handle_headers_frame(&self, frame: &Frame, decoder: &mut crate::hpack::Decoder) -> Result<(), H2Error> {
        {
            let mut state = self.incoming.lock().unwrap();
            if state.phase == Phase::Body {
                state.phase = Phase::Trailers;
            }
            if state.header_block.is_empty() {
                state.first_header_frame_flags = Some(frame.flags);
            }
        }
        let data = frame
            .without_padding(HeadersFlags::PADDED.bits())
            .map_err(|code| StreamError::new(self.stream_id, code))?;
        let end_headers = frame.flags & HeadersFlags::END_HEADERS.bits() != 0;
        {
            let mut state = self.incoming.lock().unwrap();
            state.header_block.extend_from_slice(&data);
            state.needs_continuation = !end_headers;
        }
        if self.check_header_length().await? {
            return Ok(());
        }
        if end_headers {
            self.parse_headers(decoder).await?;
        }
        Ok(())
    }

    async fn handle_continuation_frame(&self, frame: &Frame, decoder: &mut crate::hpack::Decoder) -> Result<(), H2Error> {
        if !self.incoming.lock().unwrap().needs_continuation {
            return Err(ConnectionError::new(ErrorCode::ProtocolError, "CONTINUATION without a preceding HEADERS").into());
        }
        let end_headers = frame.flags & ContinuationFlags::END_HEADERS.bits() != 0;
        {
            let mut state = self.incoming.lock().unwrap();
            state.header_block.extend_from_slice(&frame.payload);
            state.needs_continuation = !end_headers;
        }
        if self.check_header_length().await? {
            return Ok(());
        }
        if end_headers {
            self.parse_headers(decoder).await?;
        }
        Ok(())
    }

    /// Returns `Ok(true)` if the header block was rejected as too large (and
    /// handling is complete), `Ok(false)` to continue normal processing.
    async fn check_header_length(&self) -> Result<bool, H2Error> {
        let too_large = self.incoming.lock().unwrap().header_block.len() > self.max_header_size;
        if !too_large {
            return Ok(false);
        }
        if self.is_client {
            if let Some(delegate) = self.delegate() {
                delegate.on_connection_close();
            }
            self.mark_finished();
        } else {
            let _ = self
                .write_headers(
                    StartLine::Response {
                        code: 431,
                        reason: "Headers too large".to_owned(),
                    },
                    Headers::new(),
                    None,
                )
                .await;
            let _ = self.finish().await;
        }
        Ok(true)
    }

    async fn parse_headers(&self, decoder: &mut crate::hpack::Decoder) -> Result<(), H2Error> {
        let (data, first_frame_flags) = {
            let mut state = self.incoming.lock().unwrap();
            (std::mem::take(&mut state.header_block), state.first_header_frame_flags.unwrap_or(0))
        };
        let body = if first_frame_flags & HeadersFlags::PRIORITY.bits() != 0 {
            if data.len() < 5 {
                return Err(ConnectionError::new(ErrorCode::FrameSizeError, "HEADERS priority prefix truncated").into());
            }
            let stream_dep = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
            if stream_dep == self.stream_id {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, "stream cannot depend on itself").into());
            }
            &data[5..]
        } else {
            &data[..]
        };

        let decoded = decoder
            .decode(body)
            .map_err(|_| ConnectionError::new(ErrorCode::CompressionError, "HPACK decode failed"))?;

        let phase = self.incoming.lock().unwrap().phase;
        let mut has_regular_header = phase == Phase::Trailers;
        let mut pseudo_headers: Vec<(String, String)> = Vec::new();
        let mut headers: Headers = Vec::new();
        for (name, value, _mode) in decoded {
            if name.iter().any(u8::is_ascii_uppercase) {
                return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
            }
            let name_str = String::from_utf8_lossy(&name).into_owned();
            let value_str = String::from_utf8_lossy(&value).into_owned();
            if let Some(stripped) = name_str.strip_prefix(':') {
                let valid = if self.is_client {
                    stripped == "status"
                } else {
                    matches!(stripped, "method" | "scheme" | "authority" | "path")
                };
                if has_regular_header || !valid || pseudo_headers.iter().any(|(k, _)| k == &name_str) {
                    return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
                }
                if name_str == ":authority" {
                    headers.push(("host".to_owned(), value_str.clone()));
                }
                pseudo_headers.push((name_str, value_str));
            } else {
                headers.push((name_str, value_str));
                has_regular_header = true;
            }
        }

        if phase == Phase::Headers {
            self.start_request(&pseudo_headers, headers).await?;
        }
        // Trailers update stream-closing bookkeeping below but are not
        // forwarded to the delegate; trailer exposure is a documented
        // non-goal.

        let end_stream = first_frame_flags & HeadersFlags::END_STREAM.bits() != 0;
        let finished_now = self.maybe_end_stream(end_stream)?;
        let now_in_trailers = self.incoming.lock().unwrap().phase == Phase::Trailers;
        if !finished_now && now_in_trailers {
            return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
        }
        Ok(())
    }

    async fn start_request(&self, pseudo_headers: &[(String, String)], headers: Headers) -> Result<(), H2Error> {
        let get = |k: &str| pseudo_headers.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

        if headers.iter().any(|(k, _)| k == "connection") {
            return Err(ConnectionError::new(ErrorCode::ProtocolError, "connection header must not appear in HTTP/2").into());
        }
        if let Some((_, te)) = headers.iter().find(|(k, _)| k == "te") {
            if te != "trailers" {
                return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
            }
        }

        let start_line;
        let mut is_head_or_304 = false;
        if self.is_client {
            let status: u16 = get(":status")
                .ok_or_else(|| StreamError::new(self.stream_id, ErrorCode::ProtocolError))?
                .parse()
                .map_err(|_| StreamError::new(self.stream_id, ErrorCode::ProtocolError))?;
            let request_method = self.request_method.lock().unwrap().clone();
            is_head_or_304 = request_method.as_deref() == Some("HEAD") || status == 304;
            start_line = StartLine::Response { code: status, reason: String::new() };
            if status >= 200 {
                self.incoming.lock().unwrap().phase = Phase::Body;
            }
        } else {
            for key in [":method", ":scheme", ":path"] {
                if get(key).is_none() {
                    return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
                }
            }
            let method = get(":method").unwrap();
            *self.request_method.lock().unwrap() = Some(method.clone());
            start_line = StartLine::Request { method, path: get(":path").unwrap() };
            self.incoming.lock().unwrap().phase = Phase::Body;
        }

        let content_length = headers.iter().find(|(k, _)| k == "content-length").and_then(|(_, v)| v.parse::<i64>().ok());
        {
            let mut state = self.incoming.lock().unwrap();
            state.incoming_content_remaining = if is_head_or_304 { Some(0) } else { content_length };
            state.delegate_started = true;
        }

        if let Some(delegate) = self.delegate() {
            delegate.headers_received(start_line, headers);
        }
        Ok(())
    }

    /// Populates this stream directly from an already-decoded HTTP/1.1
    /// request that triggered an h2c Upgrade, bypassing HPACK entirely since
    /// no HEADERS frame carries it. Mirrors the bookkeeping `start_request`
    /// performs once pseudo-headers are validated.
    pub(crate) async fn bootstrap_from_upgrade(&self, method: String, path: String, headers: Headers, end_stream: bool) -> Result<(), H2Error> {
        self.incoming.lock().unwrap().phase = Phase::Body;
        let is_head = method == "HEAD";
        *self.request_method.lock().unwrap() = Some(method.clone());
        let content_length = headers.iter().find(|(k, _)| k == "content-length").and_then(|(_, v)| v.parse::<i64>().ok());
        {
            let mut state = self.incoming.lock().unwrap();
            state.incoming_content_remaining = if is_head { Some(0) } else { content_length };
            state.delegate_started = true;
        }

        if let Some(delegate) = self.delegate() {
            delegate.headers_received(StartLine::Request { method, path }, headers);
        }
        self.maybe_end_stream(end_stream)?;
        Ok(())
    }

    async fn handle_data_frame(&self, frame: &Frame) -> Result<(), H2Error> {
        {
            let state = self.incoming.lock().unwrap();
            if !state.header_block.is_empty() || state.needs_continuation {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, "DATA received mid-header-block").into());
            }
            if state.phase == Phase::Trailers {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, "DATA received after trailers").into());
            }
        }
        self.incoming.lock().unwrap().phase = Phase::Body;
        let data = frame
            .without_padding(DataFlags::PADDED.bits())
            .map_err(|code| StreamError::new(self.stream_id, code))?;

        let delegate_started;
        {
            let mut state = self.incoming.lock().unwrap();
            if let Some(remaining) = state.incoming_content_remaining.as_mut() {
                *remaining -= data.len() as i64;
                if *remaining < 0 {
                    return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
                }
            }
            delegate_started = state.delegate_started;
        }

        if !data.is_empty() && delegate_started {
            let wait = self.delegate().and_then(|delegate| delegate.data_received(data.clone()));
            let len = data.len();
            let shared = self.shared.clone();
            let stream_id = self.stream_id;
            match wait {
                Some(wait) => {
                    tokio::spawn(async move {
                        let _ = wait.await;
                        send_window_update(&shared, stream_id, len).await;
                    });
                }
                None => send_window_update(&shared, stream_id, len).await,
            }
        }

        self.maybe_end_stream(frame.flags & DataFlags::END_STREAM.bits() != 0)?;
        Ok(())
    }

    fn maybe_end_stream(&self, end_stream: bool) -> Result<bool, H2Error> {
        if !end_stream {
            return Ok(false);
        }
        let delegate_started = {
            let mut state = self.incoming.lock().unwrap();
            if let Some(remaining) = state.incoming_content_remaining {
                if remaining != 0 {
                    return Err(StreamError::new(self.stream_id, ErrorCode::ProtocolError).into());
                }
            }
            let started = state.delegate_started;
            state.delegate_started = false;
            started
        };
        if delegate_started {
            if let Some(delegate) = self.delegate() {
                delegate.finish();
            }
        }
        self.mark_finished();
        Ok(true)
    }

    fn handle_priority_frame(&self, frame: &Frame) -> Result<(), H2Error> {
        // Parsed only for size validation; priority-based scheduling is a
        // documented non-goal.
        warn!("stream {} received PRIORITY (ignored)", self.stream_id);
        if frame.payload.len() != 5 {
            return Err(StreamError::new(self.stream_id, ErrorCode::FrameSizeError).into());
        }
        Ok(())
    }

    fn handle_rst_stream_frame(&self, frame: &Frame) -> Result<(), H2Error> {
        if frame.payload.len() != 4 {
            return Err(ConnectionError::new(ErrorCode::FrameSizeError, "RST_STREAM payload must be 4 bytes").into());
        }
        warn!("stream {} received RST_STREAM", self.stream_id);
        let delegate_started = self.incoming.lock().unwrap().delegate_started;
        if delegate_started {
            if let Some(delegate) = self.delegate() {
                delegate.on_connection_close();
            }
        }
        self.mark_finished();
        Ok(())
    }

    /// Called by the connection multiplexer when the transport is gone
    /// (clean close or GOAWAY) rather than by any frame this stream itself
    /// received.
    pub(crate) fn notify_connection_closed(&self) {
        if self.is_finished() {
            return;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_connection_close();
        }
        self.window.close();
        self.mark_finished();
    }

    // -- Outbound --------------------------------------------------------------

    pub async fn reset(&self) {
        if let Some(shared) = self.shared() {
            let _ = shared.write_frame(frame::rst_stream_frame(self.stream_id, ErrorCode::NoError)).await;
        }
        self.window.close();
        self.mark_finished();
    }

    pub async fn write_headers(&self, start_line: StartLine, headers: Headers, chunk: Option<Bytes>) -> Result<(), WriteError> {
        match self.write_headers_inner(&start_line, &headers).await {
            Ok(()) => self.write(chunk.unwrap_or_default()).await,
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    async fn write_headers_inner(&self, start_line: &StartLine, headers: &Headers) -> Result<(), WriteError> {
        let method = self.request_method.lock().unwrap().clone();
        let is_head_or_304 = match start_line {
            StartLine::Response { code, .. } => !self.is_client && (method.as_deref() == Some("HEAD") || *code == 304),
            StartLine::Request { .. } => false,
        };
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<i64>().ok());
        *self.outgoing_content_remaining.lock().unwrap() = if is_head_or_304 { Some(0) } else { content_length };

        let mut header_list: Vec<(Bytes, Bytes, IndexMode)> = Vec::with_capacity(headers.len() + 4);
        match start_line {
            StartLine::Request { method, path } => {
                *self.request_method.lock().unwrap() = Some(method.clone());
                header_list.push((Bytes::from_static(b":method"), Bytes::from(method.clone()), IndexMode::Indexed));
                header_list.push((Bytes::from_static(b":scheme"), Bytes::from_static(b"https"), IndexMode::Indexed));
                header_list.push((Bytes::from_static(b":path"), Bytes::from(path.clone()), IndexMode::NotIndexed));
            }
            StartLine::Response { code, .. } => {
                header_list.push((Bytes::from_static(b":status"), Bytes::from(code.to_string()), IndexMode::Indexed));
            }
        }
        for (k, v) in headers {
            let k = k.to_ascii_lowercase();
            if k == "connection" {
                continue;
            }
            header_list.push((Bytes::from(k), Bytes::from(v.clone()), IndexMode::Indexed));
        }

        let shared = self.shared().ok_or(WriteError::Closed)?;
        shared
            .write_headers_frame(self.stream_id, &header_list, HeadersFlags::END_HEADERS.bits())
            .await
            .map_err(|_| WriteError::Closed)
    }

    pub async fn write(&self, chunk: Bytes) -> Result<(), WriteError> {
        if chunk.is_empty() {
            return Ok(());
        }
        {
            let mut remaining = self.outgoing_content_remaining.lock().unwrap();
            if let Some(r) = remaining.as_mut() {
                let promised_before = *r;
                *r -= chunk.len() as i64;
                if *r < 0 {
                    drop(remaining);
                    self.reset().await;
                    return Err(WriteError::ContentLengthOvershoot { written: chunk.len() as i64, promised: promised_before });
                }
            }
        }
        if let Err(e) = self.write_chunks(chunk).await {
            self.reset().await;
            return Err(e);
        }
        Ok(())
    }

    async fn write_chunks(&self, mut chunk: Bytes) -> Result<(), WriteError> {
        let _guard = self.write_lock.lock().await;
        while !chunk.is_empty() {
            let to_offer = chunk.len().min(DEFAULT_MAX_FRAME_SIZE as usize);
            let granted = self.window.consume(to_offer as i64).await.map_err(|_| WriteError::Closed)?;
            let piece = chunk.split_to(granted as usize);
            let shared = self.shared().ok_or(WriteError::Closed)?;
            shared
                .write_frame(Frame::new(FrameType::Data, 0, self.stream_id, piece))
                .await
                .map_err(|_| WriteError::Closed)?;
        }
        Ok(())
    }

    pub async fn finish(&self) -> Result<(), WriteError> {
        let remaining = *self.outgoing_content_remaining.lock().unwrap();
        if let Some(remaining) = remaining {
            if remaining != 0 {
                self.reset().await;
                return Err(WriteError::ContentLengthUndershoot { remaining });
            }
        }
        let result: Result<(), WriteError> = async {
            let _guard = self.write_lock.lock().await;
            let shared = self.shared().ok_or(WriteError::Closed)?;
            shared
                .write_frame(Frame::new(FrameType::Data, DataFlags::END_STREAM.bits(), self.stream_id, Bytes::new()))
                .await
                .map_err(|_| WriteError::Closed)
        }
        .await;
        match &result {
            Ok(()) => self.mark_finished(),
            Err(_) => self.reset().await,
        }
        result
    }
}

async fn send_window_update(shared: &Weak<Shared>, stream_id: StreamId, amount: usize) {
    if let Some(shared) = shared.upgrade() {
        let _ = shared.write_frame(frame::window_update_frame(0, amount as u32)).await;
        let _ = shared.write_frame(frame::window_update_frame(stream_id, amount as u32)).await;
    }
}
