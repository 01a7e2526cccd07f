//! Connection multiplexer: preface exchange, the one-frame-at-a-time
//! dispatch loop, SETTINGS/PING/GOAWAY handling, and stream lifecycle.
//! https://httpwg.org/specs/rfc7540.html#ConnectionMgmt
//!
//! Grounded in tornado_http2's `connection.py` (`_conn_loop`/`handle_frame`),
//! rebuilt around a single tokio task instead of a generator coroutine, per
//! the "coroutine control flow -> task + explicit state" redesign note: one
//! task owns the stream table and HPACK codec state, so neither needs a
//! lock. The part of that state an application must reach from outside the
//! loop (to open a client-initiated stream) lives in `Shared`, an `Arc`
//! handle the loop task and the application both hold -- the "model as
//! arena+index" note's resolution of the stream<->connection cycle: a
//! stream never owns its connection, only a `Weak<Shared>`.

use crate::config::Params;
use crate::delegate::ConnectionDelegate;
use crate::error::{ConnectionError, H2Error, OutputError, StreamError};
use crate::flags::PingFlags;
use crate::flow::Window;
use crate::frame::{self, Frame, FrameError};
use crate::hpack::{self, IndexMode};
use crate::stream::Stream;
use crate::transport::BoxedTransport;
use crate::types::{
    ErrorCode, FrameType, SettingsParameter, StreamId, CLIENT_PREFACE, DEFAULT_MAX_FRAME_SIZE,
    MAX_FRAME_SIZE_CEILING, MAX_WINDOW_SIZE,
};
use bytes::Bytes;
use enum_map::EnumMap;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

/// Which side of the connection this engine is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The HTTP/1.1 request that triggered an h2c Upgrade, handed in by the
/// external HTTP/1.1 engine once it has written the 101 response. Stream id 1
/// is reserved for it per https://httpwg.org/specs/rfc7540.html#discover-http.
#[derive(Debug, Clone)]
pub struct UpgradedRequest {
    pub method: String,
    pub path: String,
    pub headers: crate::types::Headers,
    pub end_stream: bool,
}

/// State reachable both from the dispatch-loop task and from application
/// code opening client-initiated streams: the transport's write half (behind
/// an async mutex, since a stream's chunked `write` serializes on it too),
/// the shared HPACK encoder, and the connection-wide flow-control window
/// that every stream window chains to.
pub struct Shared {
    writer: tokio::sync::Mutex<WriteHalf<BoxedTransport>>,
    encoder: Mutex<hpack::Encoder>,
    window: Arc<Window>,
    streams: Mutex<HashMap<StreamId, Arc<Stream>>>,
    next_local_id: AtomicU32,
    is_client: bool,
    params: Params,
}

impl Shared {
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), OutputError> {
        let mut w = self.writer.lock().await;
        frame.write_into(&mut *w).await.map_err(|err| match err {
            FrameError::Io(err) => OutputError::Io(err),
            FrameError::TooLarge(_) => OutputError::Closed,
        })
    }

    pub(crate) async fn write_headers_frame(
        &self,
        stream_id: StreamId,
        headers: &[(Bytes, Bytes, IndexMode)],
        flags: u8,
    ) -> Result<(), OutputError> {
        let payload = self.encoder.lock().unwrap().encode(headers);
        self.write_frame(Frame::new(FrameType::Headers, flags, stream_id, payload)).await
    }

    /// Opens a new stream in this side's own keyspace (odd ids for a
    /// client, even for a server) and registers it for inbound routing.
    /// Server-side stream creation happens only in response to an inbound
    /// HEADERS, inside the dispatch loop.
    pub fn open_stream(self: &Arc<Self>, delegate: Arc<dyn crate::delegate::StreamDelegate>) -> Arc<Stream> {
        let id = self.next_local_id.fetch_add(2, Ordering::SeqCst);
        let stream = self.new_stream(id, Some(delegate));
        self.streams.lock().unwrap().insert(id, stream.clone());
        stream
    }

    fn new_stream(self: &Arc<Self>, id: StreamId, delegate: Option<Arc<dyn crate::delegate::StreamDelegate>>) -> Arc<Stream> {
        debug!("opening stream {id}");
        let initial_window_size = i64::from(SettingsParameter::InitialWindowSize.default_value());
        Stream::new(
            id,
            self.is_client,
            self.params.max_header_size,
            Arc::downgrade(self),
            self.window.clone(),
            initial_window_size,
            delegate,
        )
    }

    fn local_parity(&self) -> u32 {
        u32::from(self.is_client)
    }

    /// The highest stream id this side has itself issued, or 0 if it has
    /// never opened a stream. Used to tell a frame for a stream id from our
    /// own past (closed, so a lenient stream error) from one in our own
    /// future (never issued, so a connection protocol error).
    fn highest_local_id(&self) -> StreamId {
        self.next_local_id.load(Ordering::SeqCst).saturating_sub(2)
    }
}

/// Drives one connection's frame-at-a-time dispatch loop. Built with
/// [`Connection::handshake`]; call [`Connection::handle`] to get an `Arc<Shared>`
/// before handing the connection to [`Connection::run`], which consumes it.
pub struct Connection {
    shared: Arc<Shared>,
    reader: ReadHalf<BoxedTransport>,
    decoder: hpack::Decoder,
    role: Role,
    highest_remote_id: StreamId,
    last_serviced_stream: Option<Arc<Stream>>,
    conn_delegate: Option<Arc<dyn ConnectionDelegate>>,
    received_goaway: bool,
}

fn initial_local_settings(is_client: bool) -> EnumMap<SettingsParameter, Option<u32>> {
    let mut settings: EnumMap<SettingsParameter, Option<u32>> = EnumMap::default();
    if is_client {
        // Clients advertise ENABLE_PUSH=0; server push generation is a
        // documented non-goal, so there is never a reason to invite it.
        settings[SettingsParameter::EnablePush] = Some(0);
    }
    settings
}

impl Connection {
    /// Exchanges the connection preface and initial SETTINGS over `transport`.
    /// Returns `Ok(None)` when a server-role handshake reads a preface that
    /// does not match the literal 24-byte string -- the transport is simply
    /// closed without writing anything back.
    pub async fn handshake(
        transport: BoxedTransport,
        role: Role,
        params: Params,
        conn_delegate: Option<Arc<dyn ConnectionDelegate>>,
    ) -> anyhow::Result<Option<Self>> {
        let is_client = role == Role::Client;
        let (mut reader, mut writer) = split(transport);

        if is_client {
            writer.write_all(CLIENT_PREFACE).await?;
        } else {
            let mut preface = [0u8; CLIENT_PREFACE.len()];
            if reader.read_exact(&mut preface).await.is_err() || preface != *CLIENT_PREFACE {
                return Ok(None);
            }
        }

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            encoder: Mutex::new(hpack::Encoder::new(
                SettingsParameter::HeaderTableSize.default_value() as usize,
            )),
            window: Window::new(None, None, i64::from(SettingsParameter::InitialWindowSize.default_value())),
            streams: Mutex::new(HashMap::new()),
            next_local_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            is_client,
            params,
        });

        shared.write_frame(frame::settings_frame(&initial_local_settings(is_client))).await?;
        debug!("{:?} handshake complete, local SETTINGS written", role);

        Ok(Some(Self {
            shared,
            reader,
            decoder: hpack::Decoder::new(SettingsParameter::HeaderTableSize.default_value() as usize),
            role,
            highest_remote_id: 0,
            last_serviced_stream: None,
            conn_delegate,
            received_goaway: false,
        }))
    }

    /// Server-role entry point for a transport an HTTP/1.1 front end hasn't
    /// yet committed to parsing: `peeked` is the first bytes read off the
    /// wire without consuming them. If they match the client preface prefix
    /// (the "prior knowledge" case, RFC 7540 §3.4), the transport is adopted
    /// directly in HTTP/2 server role and this returns `Ok(Some(_))` exactly
    /// like [`Connection::handshake`]. Otherwise returns `Ok(None)` and the
    /// caller should continue parsing `transport` as HTTP/1.1 -- `peeked`
    /// was only inspected, not consumed, so nothing here precedes it.
    pub async fn handshake_cleartext(
        transport: BoxedTransport,
        peeked: &[u8],
        params: Params,
        conn_delegate: Option<Arc<dyn ConnectionDelegate>>,
    ) -> anyhow::Result<Option<Self>> {
        if !crate::transport::looks_like_client_preface(peeked) {
            return Ok(None);
        }
        Self::handshake(transport, Role::Server, params, conn_delegate).await
    }

    /// Server-role entry point for the h2c Upgrade boundary: the external
    /// HTTP/1.1 engine has already written the `101 Switching Protocols`
    /// response and hands this the raw transport plus the request that asked
    /// for the upgrade. The client still sends the standard connection
    /// preface and SETTINGS immediately after the 101 response (RFC 7540
    /// §3.2), so this runs the same preface/SETTINGS exchange as
    /// [`Connection::handshake`] and then opens stream id 1 populated with
    /// `upgraded`, bypassing HPACK since the request never arrives as a
    /// HEADERS frame.
    pub async fn handshake_upgraded(
        transport: BoxedTransport,
        upgraded: UpgradedRequest,
        params: Params,
        conn_delegate: Option<Arc<dyn ConnectionDelegate>>,
    ) -> anyhow::Result<Option<Self>> {
        let mut conn = match Self::handshake(transport, Role::Server, params, conn_delegate.clone()).await? {
            Some(conn) => conn,
            None => return Ok(None),
        };

        let stream = conn.shared.new_stream(1, None);
        if let Some(conn_delegate) = &conn_delegate {
            stream.set_delegate(conn_delegate.start_request(stream.clone()));
        }
        conn.shared.streams.lock().unwrap().insert(1, stream.clone());
        conn.highest_remote_id = 1;

        stream
            .bootstrap_from_upgrade(upgraded.method, upgraded.path, upgraded.headers, upgraded.end_stream)
            .await?;

        Ok(Some(conn))
    }

    /// A handle for opening client-initiated streams and writing frames
    /// while [`Connection::run`] drives the read side on its own task.
    pub fn handle(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Runs the dispatch loop until the transport closes, a GOAWAY passes in
    /// either direction, or a connection-fatal error is raised. Transport
    /// closure and a peer-initiated GOAWAY both end the loop with `Ok(())`;
    /// a connection error we raise ourselves is reported as `Err`, having
    /// already written the corresponding GOAWAY.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let frame = match Frame::read_from(&mut self.reader, DEFAULT_MAX_FRAME_SIZE).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    trace!("transport closed cleanly");
                    self.shutdown();
                    return Ok(());
                }
                Err(FrameError::Io(err)) => {
                    trace!("transport closed: {err}");
                    self.shutdown();
                    return Ok(());
                }
                Err(FrameError::TooLarge(len)) => {
                    let err = ConnectionError::new(ErrorCode::FrameSizeError, format!("frame length {len} exceeds the negotiated maximum"));
                    self.fatal(&err).await;
                    return Err(err.into());
                }
            };

            trace!("recv frame kind={:?} stream={} flags={:#x} len={}", frame.kind(), frame.stream_id, frame.flags, frame.payload.len());

            match self.dispatch_one(frame).await {
                Ok(()) => {}
                Err(H2Error::Stream(err)) => {
                    warn!("stream {} error {:?}", err.stream_id, err.code);
                    let _ = self.shared.write_frame(frame::rst_stream_frame(err.stream_id, err.code)).await;
                }
                Err(H2Error::Connection(err)) => {
                    self.fatal(&err).await;
                    return Err(err.into());
                }
            }

            if self.received_goaway {
                self.shutdown();
                return Ok(());
            }
        }
    }

    async fn fatal(&mut self, err: &ConnectionError) {
        error!("connection error {:?}: {}", err.code, err.message.as_deref().unwrap_or("none"));
        let _ = self
            .shared
            .write_frame(frame::goaway_frame(self.highest_remote_id, err.code, err.message.as_deref()))
            .await;
        self.shutdown();
    }

    fn shutdown(&self) {
        self.shared.window.close();
        for stream in self.shared.streams.lock().unwrap().values() {
            stream.notify_connection_closed();
        }
        if let Some(delegate) = &self.conn_delegate {
            delegate.on_close();
        }
    }

    async fn dispatch_one(&mut self, frame: Frame) -> Result<(), H2Error> {
        if let Some(last) = &self.last_serviced_stream {
            if last.needs_continuation() && (frame.kind() != Some(FrameType::Continuation) || frame.stream_id != last.stream_id()) {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, "CONTINUATION frame required").into());
            }
        }

        if frame.stream_id == 0 {
            return self.handle_connection_frame(frame).await;
        }

        let existing = self.shared.streams.lock().unwrap().get(&frame.stream_id).cloned();
        if let Some(stream) = existing {
            self.last_serviced_stream = Some(stream.clone());
            return stream.handle_frame(&frame, &mut self.decoder).await;
        }

        if self.role == Role::Server && frame.kind() == Some(FrameType::Headers) {
            if frame.stream_id % 2 == self.shared.local_parity() {
                return Err(ConnectionError::new(ErrorCode::ProtocolError, "client used the server's stream-id keyspace").into());
            }
            if frame.stream_id > self.highest_remote_id {
                self.highest_remote_id = frame.stream_id;
            }
            let stream = self.shared.new_stream(frame.stream_id, None);
            if let Some(conn_delegate) = &self.conn_delegate {
                stream.set_delegate(conn_delegate.start_request(stream.clone()));
            }
            self.shared.streams.lock().unwrap().insert(frame.stream_id, stream.clone());
            self.last_serviced_stream = Some(stream.clone());
            return stream.handle_frame(&frame, &mut self.decoder).await;
        }

        // No such stream, and we won't create one: decide whether the id
        // names a stream from the past (STREAM_CLOSED) or the future
        // (PROTOCOL_ERROR).
        let is_local = frame.stream_id % 2 == self.shared.local_parity();
        if is_local {
            if frame.stream_id <= self.shared.highest_local_id() {
                Err(StreamError::new(frame.stream_id, ErrorCode::StreamClosed).into())
            } else {
                Err(ConnectionError::new(ErrorCode::ProtocolError, "frame for a stream id we never issued").into())
            }
        } else if frame.stream_id <= self.highest_remote_id {
            Err(StreamError::new(frame.stream_id, ErrorCode::StreamClosed).into())
        } else {
            Err(ConnectionError::new(ErrorCode::ProtocolError, "frame for a stream id the peer never opened").into())
        }
    }

    async fn handle_connection_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        match frame.kind() {
            Some(FrameType::Settings) => self.handle_settings(frame).await,
            Some(FrameType::WindowUpdate) => self.shared.window.apply_window_update(&frame.payload),
            Some(FrameType::Ping) => self.handle_ping(frame).await,
            Some(FrameType::GoAway) => {
                self.handle_goaway(frame);
                Ok(())
            }
            None => Ok(()), // unknown frame types on stream 0 are silently discarded
            Some(kind) => Err(ConnectionError::new(ErrorCode::ProtocolError, format!("{kind:?} is not valid on stream 0")).into()),
        }
    }

    async fn handle_settings(&mut self, frame: Frame) -> Result<(), H2Error> {
        if frame.flags & crate::flags::SettingsFlags::ACK.bits() != 0 {
            if !frame.payload.is_empty() {
                return Err(ConnectionError::new(ErrorCode::FrameSizeError, "SETTINGS ACK must be empty").into());
            }
            return Ok(());
        }
        let settings = frame::parse_settings_payload(&frame.payload)
            .map_err(|code| ConnectionError::new(code, "SETTINGS payload is not a multiple of 6 bytes"))?;
        for (param, value) in &settings {
            // Values are validated but not applied to connection behavior;
            // see DESIGN.md.
            if let Some(value) = value {
                match param {
                    SettingsParameter::EnablePush if *value > 1 => {
                        return Err(ConnectionError::new(ErrorCode::ProtocolError, "ENABLE_PUSH must be 0 or 1").into());
                    }
                    SettingsParameter::InitialWindowSize if *value > MAX_WINDOW_SIZE => {
                        return Err(ConnectionError::new(ErrorCode::FlowControlError, "INITIAL_WINDOW_SIZE too large").into());
                    }
                    SettingsParameter::MaxFrameSize if *value < DEFAULT_MAX_FRAME_SIZE || *value > MAX_FRAME_SIZE_CEILING => {
                        return Err(ConnectionError::new(ErrorCode::ProtocolError, "MAX_FRAME_SIZE out of bounds").into());
                    }
                    _ => {}
                }
            }
        }
        debug!("peer SETTINGS: {:?}", settings);
        self.shared
            .write_frame(frame::settings_ack_frame())
            .await
            .map_err(|_| ConnectionError::new(ErrorCode::InternalError, "failed to write SETTINGS ack"))?;
        Ok(())
    }

    async fn handle_ping(&mut self, frame: Frame) -> Result<(), H2Error> {
        if frame.flags & PingFlags::ACK.bits() != 0 {
            return Ok(());
        }
        if frame.payload.len() != 8 {
            return Err(ConnectionError::new(ErrorCode::FrameSizeError, "PING payload must be 8 bytes").into());
        }
        self.shared
            .write_frame(frame::ping_ack_frame(frame.payload))
            .await
            .map_err(|_| ConnectionError::new(ErrorCode::InternalError, "failed to write PING ack"))?;
        Ok(())
    }

    fn handle_goaway(&mut self, frame: Frame) {
        let code = frame
            .payload
            .get(4..8)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .and_then(<ErrorCode as num_traits::FromPrimitive>::from_u32)
            .unwrap_or(ErrorCode::NoError);
        error!("received GOAWAY code={code:?}");
        self.received_goaway = true;
    }
}

/// Never held by a `Stream` directly (see `Shared`'s doc comment); this
/// alias documents the borrow shape a stream holds back to its connection.
pub type SharedHandle = Weak<Shared>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{StartLine, StreamDelegate};
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use tokio::io::duplex;

    struct RecordingDelegate {
        got_headers: Mutex<Option<(StartLine, crate::types::Headers)>>,
        got_data: Mutex<Vec<u8>>,
        finished: AtomicBool,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                got_headers: Mutex::new(None),
                got_data: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
            })
        }
    }

    impl StreamDelegate for RecordingDelegate {
        fn headers_received(&self, start_line: StartLine, headers: crate::types::Headers) {
            *self.got_headers.lock().unwrap() = Some((start_line, headers));
        }
        fn data_received(&self, chunk: Bytes) -> Option<tokio::sync::oneshot::Receiver<()>> {
            self.got_data.lock().unwrap().extend_from_slice(&chunk);
            None
        }
        fn finish(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
        fn on_connection_close(&self) {}
    }

    struct AcceptingConnectionDelegate {
        delegate: Arc<RecordingDelegate>,
    }

    impl ConnectionDelegate for AcceptingConnectionDelegate {
        fn start_request(&self, _stream: Arc<Stream>) -> Arc<dyn StreamDelegate> {
            self.delegate.clone()
        }
        fn on_close(&self) {}
    }

    #[tokio::test]
    async fn client_and_server_exchange_get_hello() {
        let (client_io, server_io) = duplex(4096);
        let server_delegate = RecordingDelegate::new();
        let conn_delegate = Arc::new(AcceptingConnectionDelegate { delegate: server_delegate.clone() });

        let client = Connection::handshake(Box::new(client_io), Role::Client, Params::default(), None)
            .await
            .unwrap()
            .unwrap();
        let server = Connection::handshake(Box::new(server_io), Role::Server, Params::default(), Some(conn_delegate))
            .await
            .unwrap()
            .unwrap();

        let client_handle = client.handle();
        tokio::spawn(client.run());
        tokio::spawn(server.run());

        let client_side_delegate = RecordingDelegate::new();
        let stream = client_handle.open_stream(client_side_delegate.clone());
        stream
            .write_headers(
                StartLine::Request { method: "GET".into(), path: "/hello".into() },
                vec![(":authority".into(), "example.com".into())],
                None,
            )
            .await
            .unwrap();
        stream.finish().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if server_delegate.got_headers.lock().unwrap().is_some() && server_delegate.finished.load(Ordering::SeqCst) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (start_line, _headers) = server_delegate.got_headers.lock().unwrap().take().unwrap();
        assert!(matches!(start_line, StartLine::Request { ref method, ref path } if method == "GET" && path == "/hello"));
    }
}
