//! HPACK header compression. https://httpwg.org/specs/rfc7541.html
//!
//! Indices 1..=61 address the static table (Appendix A); indices 62.. address
//! the dynamic table, counting from its newest entry.

use crate::bitio::{BitReader, BitWriter};
use crate::huffman;
use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HpackError {
    #[error("header block ended unexpectedly")]
    UnexpectedEnd,
    #[error("header field index {0} is not in the static or dynamic table")]
    InvalidIndex(u64),
    #[error("huffman decoding failed: {0}")]
    Huffman(#[from] crate::huffman::HuffmanError),
    #[error("dynamic table size update to {requested} exceeds the advertised limit of {limit}")]
    DynamicTableSizeTooLarge { requested: usize, limit: usize },
    #[error("dynamic table size update appeared after a header field was emitted")]
    SizeUpdateAfterHeader,
}

impl From<crate::bitio::BitIoError> for HpackError {
    fn from(_: crate::bitio::BitIoError) -> Self {
        HpackError::UnexpectedEnd
    }
}

/// How a decoded (or to-be-encoded) header field should be treated by the
/// compressor: re-indexed, or excluded from the dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Indexed,
    NotIndexed,
    NeverIndexed,
}

#[derive(Debug, Clone)]
struct TableEntry {
    size: usize,
    name: Bytes,
    value: Bytes,
}

impl TableEntry {
    fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ $(,)? ) => {
        [
            $(
                (&$name[..], &$value[..])
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [(&[u8], &[u8]); 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

/// The evictable, ordered HPACK header history, newest entry first.
#[derive(Debug, Clone)]
struct DynamicTable {
    max_size: usize,
    current_size: usize,
    entries: VecDeque<TableEntry>,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            entries: VecDeque::new(),
        }
    }

    fn get(&self, dynamic_index: usize) -> Option<(Bytes, Bytes)> {
        self.entries
            .get(dynamic_index - 1)
            .map(|e| (e.name.clone(), e.value.clone()))
    }

    fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        if entry.size > self.max_size {
            // An entry larger than the limit empties the table instead of being stored.
            self.entries.clear();
            self.current_size = 0;
            return;
        }
        self.current_size += entry.size;
        self.entries.push_front(entry);
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            match self.entries.pop_back() {
                Some(popped) => self.current_size -= popped.size,
                None => break,
            }
        }
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    /// Find an entry by (name, value), returning (1-based dynamic index, exact value match).
    fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_only = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.name.as_ref() == name {
                if e.value.as_ref() == value {
                    return Some((i + 1, true));
                }
                if name_only.is_none() {
                    name_only = Some(i + 1);
                }
            }
        }
        name_only.map(|i| (i, false))
    }
}

fn lookup(dynamic: &DynamicTable, index: u64) -> Result<(Bytes, Bytes), HpackError> {
    if index == 0 {
        return Err(HpackError::InvalidIndex(index));
    }
    let index = index as usize;
    if index <= STATIC_TABLE.len() {
        let (n, v) = STATIC_TABLE[index - 1];
        return Ok((Bytes::from_static(n), Bytes::from_static(v)));
    }
    dynamic
        .get(index - STATIC_TABLE.len())
        .ok_or(HpackError::InvalidIndex(index as u64))
}

/// Find a table index (static preferred, then dynamic) for `name`/`value`.
/// Returns (index, exact value match).
fn find_index(dynamic: &DynamicTable, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
    let mut name_only = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return Some((i + 1, true));
            }
            if name_only.is_none() {
                name_only = Some(i + 1);
            }
        }
    }
    match dynamic.find(name, value) {
        Some((i, true)) => Some((STATIC_TABLE.len() + i, true)),
        Some((i, false)) if name_only.is_none() => Some((STATIC_TABLE.len() + i, false)),
        _ => name_only.map(|i| (i, false)),
    }
}

fn read_string(r: &mut BitReader<'_>) -> Result<Bytes, HpackError> {
    let is_huffman = r.read_bit()? == 1;
    let len = r.read_hpack_int()? as usize;
    if is_huffman {
        Ok(Bytes::from(huffman::decode(r, len)?))
    } else {
        let mut buf = Vec::with_capacity(len);
        for _ in 0..len {
            buf.push(r.read_byte()?);
        }
        Ok(Bytes::from(buf))
    }
}

fn write_string(w: &mut BitWriter, s: &[u8]) {
    let huff_len = huffman::encoded_len(s);
    if huff_len < s.len() {
        w.write_bit(1);
        w.write_hpack_int(huff_len as u64);
        for byte in huffman::encode(s) {
            w.write_byte(byte);
        }
    } else {
        w.write_bit(0);
        w.write_hpack_int(s.len() as u64);
        for &byte in s {
            w.write_byte(byte);
        }
    }
}

/// Decodes HPACK-encoded header blocks against a shared dynamic table.
#[derive(Debug, Clone)]
pub struct Decoder {
    dynamic: DynamicTable,
    /// Ceiling on HEADER_TABLE_SIZE we have advertised to the peer; a size
    /// update above this is a compression error.
    advertised_max_size: usize,
}

impl Decoder {
    pub fn new(advertised_max_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(advertised_max_size),
            advertised_max_size,
        }
    }

    /// Call when our own outgoing HEADER_TABLE_SIZE setting changes.
    pub fn set_advertised_max_size(&mut self, size: usize) {
        self.advertised_max_size = size;
        if self.dynamic.max_size > size {
            self.dynamic.set_max_size(size);
        }
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<(Bytes, Bytes, IndexMode)>, HpackError> {
        let mut r = BitReader::new(data);
        let mut out = Vec::new();
        let mut any_header_emitted = false;
        while !r.at_end() {
            let b0 = r.read_bit()?;
            if b0 == 1 {
                // Indexed header field: 1xxxxxxx, 7-bit prefix.
                let index = r.read_hpack_int()?;
                let (name, value) = lookup(&self.dynamic, index)?;
                out.push((name, value, IndexMode::Indexed));
                any_header_emitted = true;
                continue;
            }
            let b1 = r.read_bit()?;
            if b1 == 1 {
                // Literal with incremental indexing: 01xxxxxx, 6-bit prefix.
                let (name, value) = self.read_literal(&mut r, 6)?;
                self.dynamic.insert(name.clone(), value.clone());
                out.push((name, value, IndexMode::Indexed));
                any_header_emitted = true;
                continue;
            }
            let b2 = r.read_bit()?;
            if b2 == 1 {
                // Dynamic table size update: 001xxxxx, 5-bit prefix.
                if any_header_emitted {
                    return Err(HpackError::SizeUpdateAfterHeader);
                }
                let new_size = r.read_hpack_int()? as usize;
                if new_size > self.advertised_max_size {
                    return Err(HpackError::DynamicTableSizeTooLarge {
                        requested: new_size,
                        limit: self.advertised_max_size,
                    });
                }
                self.dynamic.set_max_size(new_size);
                continue;
            }
            let b3 = r.read_bit()?;
            if b3 == 1 {
                // Literal never indexed: 0001xxxx, 4-bit prefix.
                let (name, value) = self.read_literal(&mut r, 4)?;
                out.push((name, value, IndexMode::NeverIndexed));
            } else {
                // Literal without indexing: 0000xxxx, 4-bit prefix.
                let (name, value) = self.read_literal(&mut r, 4)?;
                out.push((name, value, IndexMode::NotIndexed));
            }
            any_header_emitted = true;
        }
        Ok(out)
    }

    fn read_literal(&self, r: &mut BitReader<'_>, _prefix_bits: u32) -> Result<(Bytes, Bytes), HpackError> {
        let name_index = r.read_hpack_int()?;
        let name = if name_index == 0 {
            read_string(r)?
        } else {
            lookup(&self.dynamic, name_index)?.0
        };
        let value = read_string(r)?;
        Ok((name, value))
    }
}

/// Encodes header lists against a shared dynamic table.
#[derive(Debug, Clone)]
pub struct Encoder {
    dynamic: DynamicTable,
}

impl Encoder {
    pub fn new(dynamic_table_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(dynamic_table_size),
        }
    }

    /// Call when the peer's HEADER_TABLE_SIZE setting changes.
    ///
    /// Per RFC 7541 §4.2, lowering the limit requires emitting a dynamic
    /// table size update at the front of the next encoded block; this is
    /// not implemented (see DESIGN.md Open Question (a)).
    pub fn set_max_size(&mut self, size: usize) {
        self.dynamic.set_max_size(size);
    }

    pub fn encode(&mut self, headers: &[(Bytes, Bytes, IndexMode)]) -> Vec<u8> {
        let mut w = BitWriter::new();
        for (name, value, mode) in headers {
            let name = Bytes::from(name.to_ascii_lowercase());
            match mode {
                IndexMode::Indexed => {
                    match find_index(&self.dynamic, &name, value) {
                        Some((index, true)) => {
                            w.write_bit(1);
                            w.write_hpack_int(index as u64);
                        }
                        Some((index, false)) => {
                            w.write_bit(0);
                            w.write_bit(1);
                            w.write_hpack_int(index as u64);
                            write_string(&mut w, value);
                        }
                        None => {
                            w.write_bit(0);
                            w.write_bit(1);
                            w.write_hpack_int(0);
                            write_string(&mut w, &name);
                            write_string(&mut w, value);
                        }
                    }
                    self.dynamic.insert(name, value.clone());
                }
                IndexMode::NotIndexed | IndexMode::NeverIndexed => {
                    w.write_bit(0);
                    w.write_bit(0);
                    w.write_bit(0);
                    w.write_bit(if *mode == IndexMode::NeverIndexed { 1 } else { 0 });
                    match find_index(&self.dynamic, &name, value) {
                        Some((index, _)) => w.write_hpack_int(index as u64),
                        None => {
                            w.write_hpack_int(0);
                            write_string(&mut w, &name);
                        }
                    }
                    write_string(&mut w, value);
                }
            }
        }
        w.into_bytes()
    }
}
