use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// An ordered header list as seen by application code: lowercase names,
/// pseudo-headers (`:method`, `:status`, ...) interleaved in send order.
pub type Headers = Vec<(String, String)>;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Graceful shutdown, or the condition named elsewhere is not itself an error.
    NoError = 0x0,
    /// No more specific error code is applicable.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// A SETTINGS frame was sent but not acknowledged in a timely manner.
    SettingsTimeout = 0x4,
    /// A frame was received for a stream that was already half- or fully closed.
    StreamClosed = 0x5,
    /// A frame was received with an invalid size.
    FrameSizeError = 0x6,
    /// The stream was refused prior to any application processing.
    RefusedStream = 0x7,
    /// The endpoint no longer needs the stream.
    Cancel = 0x8,
    /// The header compression state for the connection became unusable.
    CompressionError = 0x9,
    /// A CONNECT-established connection was reset or closed abnormally.
    ConnectError = 0xa,
    /// The peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The negotiated TLS parameters do not meet security requirements.
    InadequateSecurity = 0xc,
    /// The peer should use HTTP/1.1 for this request.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode header
    /// blocks, in octets. Initial value is 4,096.
    HeaderTableSize = 0x1,
    /// 0 or 1. Disables server push when 0. Initial value is 1.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender permits the peer to
    /// open. Unlimited when absent.
    MaxConcurrentStreams = 0x3,
    /// Sender's initial flow-control window size for new streams. Initial
    /// value is 65,535.
    InitialWindowSize = 0x4,
    /// Largest frame payload, in octets, the sender is willing to receive.
    /// Initial value is 16,384; MUST be within [16384, 2^24-1].
    MaxFrameSize = 0x5,
    /// Advisory maximum uncompressed header list size, in octets. Unlimited
    /// when absent.
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Value assumed before any SETTINGS frame has been received from the peer.
    pub fn default_value(self) -> u32 {
        match self {
            SettingsParameter::HeaderTableSize => 4096,
            SettingsParameter::EnablePush => 1,
            SettingsParameter::MaxConcurrentStreams => u32::MAX,
            SettingsParameter::InitialWindowSize => 65_535,
            SettingsParameter::MaxFrameSize => 16_384,
            SettingsParameter::MaxHeaderListSize => u32::MAX,
        }
    }
}

pub const MAX_WINDOW_SIZE: u32 = (1u32 << 31) - 1;
pub const MAX_FRAME_SIZE_CEILING: u32 = (1u32 << 24) - 1;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// https://httpwg.org/specs/rfc7540.html#iana-alpn
pub const ALPN_H2: &str = "h2";
pub const ALPN_H2C: &str = "h2c";

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
