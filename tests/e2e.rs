//! The numbered end-to-end scenarios named directly in the engine's
//! specification that aren't already exercised by `basic.rs`/`client.rs`
//! (the RFC 7541 decode examples and the GET/hello and large-response
//! scenarios): client preface accept/reject, and a protocol error closing
//! the connection with GOAWAY.

use http2::{Connection, ConnectionDelegate, Params, Role, Stream, StreamDelegate};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

struct NullConnectionDelegate;
impl ConnectionDelegate for NullConnectionDelegate {
    fn start_request(&self, _stream: Arc<Stream>) -> Arc<dyn StreamDelegate> {
        unreachable!("no stream should ever open in these scenarios")
    }
    fn on_close(&self) {}
}

/// A raw HEADERS frame with an empty payload: enough to exercise stream-id
/// keyspace classification without needing an HPACK-encoded header block.
fn raw_headers_frame(stream_id: u32, flags: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.extend_from_slice(&0u32.to_be_bytes()[1..]); // length = 0
    buf.push(0x1); // HEADERS
    buf.push(flags);
    buf.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    buf
}

/// Scenario 1: a server given exactly the literal 24-byte preface continues
/// the handshake and writes its own SETTINGS frame; given any other 24
/// bytes it closes the transport without writing anything back.
#[tokio::test]
async fn client_preface_accepted_continues_handshake() {
    let (mut client_io, server_io) = duplex(4096);
    client_io.write_all(CLIENT_PREFACE).await.unwrap();

    let server = Connection::handshake(Box::new(server_io), Role::Server, Params::default(), None)
        .await
        .unwrap();
    assert!(server.is_some(), "valid preface must produce a live connection");

    tokio::spawn(server.unwrap().run());

    // The server must have written its own SETTINGS frame (type 0x4) as
    // the first thing back on the wire.
    let mut header = [0u8; 9];
    timeout(Duration::from_secs(1), client_io.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[3], 0x4, "expected a SETTINGS frame type byte");
    assert_eq!(&header[5..9], &[0, 0, 0, 0], "SETTINGS is a stream-0 frame");
}

#[tokio::test]
async fn bogus_preface_closes_transport_silently() {
    let (mut client_io, server_io) = duplex(4096);
    client_io.write_all(b"not the http/2 preface at all!!").await.unwrap();

    let server = Connection::handshake(Box::new(server_io), Role::Server, Params::default(), None)
        .await
        .unwrap();
    assert!(server.is_none(), "a non-matching preface must reject the connection");

    // Nothing should have been written back; the read side observes EOF
    // rather than any bytes.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_millis(200), client_io.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "rejecting the preface must not write any response bytes");
}

/// Scenario 6: a server receiving a HEADERS frame on a stream id in its own
/// (even) keyspace -- never validly opened by a client -- is a connection
/// protocol error. The engine must write GOAWAY with PROTOCOL_ERROR and
/// close the transport.
#[tokio::test]
async fn headers_on_server_keyspace_id_is_a_protocol_error() {
    let (mut client_io, server_io) = duplex(4096);
    client_io.write_all(CLIENT_PREFACE).await.unwrap();

    let server = Connection::handshake(Box::new(server_io), Role::Server, Params::default(), Some(Arc::new(NullConnectionDelegate)))
        .await
        .unwrap()
        .unwrap();
    let run_handle = tokio::spawn(server.run());

    // Drain the server's initial SETTINGS frame.
    let mut header = [0u8; 9];
    client_io.read_exact(&mut header).await.unwrap();
    let settings_len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let mut discard = vec![0u8; settings_len];
    client_io.read_exact(&mut discard).await.unwrap();

    // Stream id 2 is server-initiated (even); a client must never use it.
    client_io.write_all(&raw_headers_frame(2, 0x4)).await.unwrap();

    let result = timeout(Duration::from_secs(1), run_handle).await.unwrap().unwrap();
    assert!(result.is_err(), "a protocol error must surface from Connection::run");

    // The server must have written a GOAWAY (type 0x7) on stream 0 before
    // closing, carrying PROTOCOL_ERROR (code 0x1).
    let mut header = [0u8; 9];
    timeout(Duration::from_secs(1), client_io.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[3], 0x7, "expected a GOAWAY frame type byte");
    assert_eq!(&header[5..9], &[0, 0, 0, 0], "GOAWAY is a stream-0 frame");
    let payload_len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let mut payload = vec![0u8; payload_len];
    client_io.read_exact(&mut payload).await.unwrap();
    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    assert_eq!(code, 0x1, "expected PROTOCOL_ERROR");
}
