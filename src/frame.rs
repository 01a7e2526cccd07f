//! The nine-byte frame header and the ten RFC 7540 frame types.
//! https://httpwg.org/specs/rfc7540.html#FrameHeader

use crate::types::{ErrorCode, FrameType, SettingsParameter, StreamId};
use bytes::Bytes;
use enum_map::EnumMap;
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds the negotiated maximum")]
    TooLarge(u32),
}

/// A single frame as it travels the wire. `typ` is the raw type byte rather
/// than `FrameType` directly, since RFC 7540 §4.1 requires unknown types be
/// preserved and silently ignored rather than rejected; use [`Frame::kind`]
/// to recognize one of the ten defined types.
#[derive(Debug, Clone)]
pub struct Frame {
    pub typ: u8,
    pub flags: u8,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(typ: FrameType, flags: u8, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            typ: typ.to_u8().expect("FrameType is repr(u8)"),
            flags,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.typ)
    }

    /// Reads one frame header plus payload from `r`, rejecting payloads
    /// larger than `max_frame_size`. Returns `Ok(None)` on a clean EOF before
    /// any header bytes were read.
    pub async fn read_from<R: AsyncReadExt + Unpin>(
        r: &mut R,
        max_frame_size: u32,
    ) -> Result<Option<Self>, FrameError> {
        let mut header = [0u8; 9];
        if !read_exact_or_eof(r, &mut header).await? {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        if length > max_frame_size {
            return Err(FrameError::TooLarge(length));
        }
        let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;
        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload).await?;
        Ok(Some(Self {
            typ: header[3],
            flags: header[4],
            stream_id,
            payload: Bytes::from(payload),
        }))
    }

    pub async fn write_into<W: AsyncWriteExt + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
        let mut header = [0u8; 9];
        header[0..3].copy_from_slice(&(self.payload.len() as u32).to_be_bytes()[1..]);
        header[3] = self.typ;
        header[4] = self.flags;
        header[5..9].copy_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
        w.write_all(&header).await?;
        w.write_all(&self.payload).await?;
        Ok(())
    }

    /// Strips a PADDED frame's one-byte pad length prefix and trailing
    /// padding, per RFC 7540 §6.1/§6.2's `Pad Length` field.
    pub fn without_padding(&self, padded_flag: u8) -> Result<Bytes, ErrorCode> {
        if self.flags & padded_flag == 0 {
            return Ok(self.payload.clone());
        }
        if self.payload.is_empty() {
            return Err(ErrorCode::ProtocolError);
        }
        let pad_len = self.payload[0] as usize;
        if pad_len + 1 > self.payload.len() {
            return Err(ErrorCode::ProtocolError);
        }
        Ok(self.payload.slice(1..self.payload.len() - pad_len))
    }
}

async fn read_exact_or_eof<R: AsyncReadExt + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short frame header"));
        }
        filled += n;
    }
    Ok(true)
}

/// Parses a SETTINGS frame payload: a sequence of 16-bit code / 32-bit value
/// records. Returns `FrameSizeError` if the payload is not a multiple of 6
/// bytes; unknown codes are silently ignored per RFC 7540 §6.5.2. The six
/// settings parameters are a fixed, small key set, so this is an `EnumMap`
/// rather than a `HashMap` (as the teacher's own `connection.rs` keeps its
/// settings table); `None` means the peer never sent that parameter.
pub fn parse_settings_payload(payload: &[u8]) -> Result<EnumMap<SettingsParameter, Option<u32>>, ErrorCode> {
    if payload.len() % 6 != 0 {
        return Err(ErrorCode::FrameSizeError);
    }
    let mut settings: EnumMap<SettingsParameter, Option<u32>> = EnumMap::default();
    for chunk in payload.chunks_exact(6) {
        let code = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        if let Some(param) = SettingsParameter::from_u16(code) {
            settings[param] = Some(value);
        }
    }
    Ok(settings)
}

pub fn encode_settings_payload(settings: &EnumMap<SettingsParameter, Option<u32>>) -> Vec<u8> {
    let mut payload = Vec::new();
    for (param, value) in settings {
        if let Some(value) = value {
            payload.extend_from_slice(&param.to_u16().unwrap().to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
    }
    payload
}

pub fn settings_frame(settings: &EnumMap<SettingsParameter, Option<u32>>) -> Frame {
    Frame::new(FrameType::Settings, 0, 0, encode_settings_payload(settings))
}

pub fn settings_ack_frame() -> Frame {
    Frame::new(FrameType::Settings, crate::flags::SettingsFlags::ACK.bits(), 0, Bytes::new())
}

pub fn window_update_frame(stream_id: StreamId, increment: u32) -> Frame {
    Frame::new(FrameType::WindowUpdate, 0, stream_id, (increment & 0x7fff_ffff).to_be_bytes().to_vec())
}

pub fn rst_stream_frame(stream_id: StreamId, code: ErrorCode) -> Frame {
    let code = code.to_u32().unwrap_or(0).to_be_bytes();
    Frame::new(FrameType::ResetStream, 0, stream_id, code.to_vec())
}

pub fn goaway_frame(last_stream_id: StreamId, code: ErrorCode, message: Option<&str>) -> Frame {
    let mut payload = Vec::with_capacity(8 + message.map_or(0, str::len));
    payload.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    payload.extend_from_slice(&code.to_u32().unwrap_or(0).to_be_bytes());
    if let Some(message) = message {
        payload.extend_from_slice(message.as_bytes());
    }
    Frame::new(FrameType::GoAway, 0, 0, payload)
}

pub fn ping_ack_frame(payload: Bytes) -> Frame {
    Frame::new(FrameType::Ping, crate::flags::PingFlags::ACK.bits(), 0, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_header_and_payload() {
        let frame = Frame::new(FrameType::Headers, 0x4, 3, b"hello".to_vec());
        let mut buf = Vec::new();
        frame.write_into(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 9 + 5);

        let mut cursor = std::io::Cursor::new(buf);
        let read = Frame::read_from(&mut cursor, 16384).await.unwrap().unwrap();
        assert_eq!(read.kind(), Some(FrameType::Headers));
        assert_eq!(read.flags, 0x4);
        assert_eq!(read.stream_id, 3);
        assert_eq!(&read.payload[..], b"hello");
    }

    #[tokio::test]
    async fn unknown_frame_type_is_preserved_not_rejected() {
        let mut buf = vec![0, 0, 0, 0xff, 0, 0, 0, 0, 0];
        buf[0..3].copy_from_slice(&0u32.to_be_bytes()[1..]);
        let mut cursor = std::io::Cursor::new(buf);
        let frame = Frame::read_from(&mut cursor, 16384).await.unwrap().unwrap();
        assert_eq!(frame.kind(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let frame = Frame::new(FrameType::Data, 0, 1, vec![0u8; 20]);
        let mut buf = Vec::new();
        frame.write_into(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = Frame::read_from(&mut cursor, 10).await;
        assert!(matches!(err, Err(FrameError::TooLarge(20))));
    }

    #[test]
    fn strips_padding() {
        let mut payload = vec![2u8]; // pad length
        payload.extend_from_slice(b"hi");
        payload.extend_from_slice(&[0, 0]);
        let frame = Frame::new(FrameType::Data, 0x8, 1, payload);
        let data = frame.without_padding(0x8).unwrap();
        assert_eq!(&data[..], b"hi");
    }

    #[test]
    fn padding_longer_than_payload_is_an_error() {
        let frame = Frame::new(FrameType::Data, 0x8, 1, vec![5u8, b'h', b'i']);
        assert!(frame.without_padding(0x8).is_err());
    }

    #[test]
    fn settings_payload_round_trip() {
        let mut settings: EnumMap<SettingsParameter, Option<u32>> = EnumMap::default();
        settings[SettingsParameter::InitialWindowSize] = Some(1_048_576);
        let payload = encode_settings_payload(&settings);
        let parsed = parse_settings_payload(&payload).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn settings_payload_not_multiple_of_six_is_frame_size_error() {
        assert_eq!(parse_settings_payload(&[0u8; 5]), Err(ErrorCode::FrameSizeError));
    }
}
