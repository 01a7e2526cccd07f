//! Connection-wide tunables, independent of the negotiated SETTINGS.

/// https://httpwg.org/specs/rfc7540.html - tunables not carried in SETTINGS.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Largest amount of body data read from the application at once before
    /// it is split into DATA frames.
    pub chunk_size: usize,
    /// Upper bound on the uncompressed size of a single header block; exceeding
    /// it produces a synthesized 431 (server) or fails the request (client).
    pub max_header_size: usize,
    /// Whether a `content-encoding: gzip` response body should be transparently
    /// inflated for the application. Not implemented; always `false`.
    pub decompress: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            chunk_size: 65536,
            max_header_size: 65536,
            decompress: false,
        }
    }
}
