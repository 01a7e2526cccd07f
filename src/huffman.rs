//! HPACK static Huffman coder. https://httpwg.org/specs/rfc7541.html#huffman.code
//!
//! The code table is the fixed one from RFC 7541 Appendix B: 256 byte values
//! plus the end-of-string symbol (index 256), each mapped to a 5..30 bit
//! code. It is loaded once into a per-byte code table for encoding and a
//! binary trie for decoding.

use crate::bitio::{BitReader, BitWriter};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanError {
    #[error("huffman padding contains a 0 bit")]
    InvalidPaddingBit,
    #[error("huffman padding is longer than 7 bits")]
    PaddingTooLong,
    #[error("huffman code does not correspond to any symbol")]
    InvalidCode,
    #[error("huffman decoder ran out of input before the byte limit")]
    UnexpectedEnd,
}

const EOS: usize = 256;

#[rustfmt::skip]
const CODES: [u32; 257] = [
    0x1ff8,0x7fffd8,0xfffffe2,0xfffffe3,0xfffffe4,0xfffffe5,0xfffffe6,0xfffffe7,0xfffffe8,0xffffea,0x3ffffffc,0xfffffe9,0xfffffea,0x3ffffffd,0xfffffeb,0xfffffec,0xfffffed,0xfffffee,0xfffffef,0xffffff0,0xffffff1,0xffffff2,0x3ffffffe,0xffffff3,0xffffff4,0xffffff5,0xffffff6,0xffffff7,0xffffff8,0xffffff9,0xffffffa,0xffffffb,0x14,0x3f8,0x3f9,0xffa,0x1ff9,0x15,0xf8,0x7fa,0x3fa,0x3fb,0xf9,0x7fb,0xfa,0x16,0x17,0x18,0x0,0x1,0x2,0x19,0x1a,0x1b,0x1c,0x1d,0x1e,0x1f,0x5c,0xfb,0x7ffc,0x20,0xffb,0x3fc,0x1ffa,0x21,0x5d,0x5e,0x5f,0x60,0x61,0x62,0x63,0x64,0x65,0x66,0x67,0x68,0x69,0x6a,0x6b,0x6c,0x6d,0x6e,0x6f,0x70,0x71,0x72,0xfc,0x73,0xfd,0x1ffb,0x7fff0,0x1ffc,0x3ffc,0x22,0x7ffd,0x3,0x23,0x4,0x24,0x5,0x25,0x26,0x27,0x6,0x74,0x75,0x28,0x29,0x2a,0x7,0x2b,0x76,0x2c,0x8,0x9,0x2d,0x77,0x78,0x79,0x7a,0x7b,0x7ffe,0x7fc,0x3ffd,0x1ffd,0xffffffc,0xfffe6,0x3fffd2,0xfffe7,0xfffe8,0x3fffd3,0x3fffd4,0x3fffd5,0x7fffd9,0x3fffd6,0x7fffda,0x7fffdb,0x7fffdc,0x7fffdd,0x7fffde,0xffffeb,0x7fffdf,0xffffec,0xffffed,0x3fffd7,0x7fffe0,0xffffee,0x7fffe1,0x7fffe2,0x7fffe3,0x7fffe4,0x1fffdc,0x3fffd8,0x7fffe5,0x3fffd9,0x7fffe6,0x7fffe7,0xffffef,0x3fffda,0x1fffdd,0xfffe9,0x3fffdb,0x3fffdc,0x7fffe8,0x7fffe9,0x1fffde,0x7fffea,0x3fffdd,0x3fffde,0xfffff0,0x1fffdf,0x3fffdf,0x7fffeb,0x7fffec,0x1fffe0,0x1fffe1,0x3fffe0,0x1fffe2,0x7fffed,0x3fffe1,0x7fffee,0x7fffef,0xfffea,0x3fffe2,0x3fffe3,0x3fffe4,0x7ffff0,0x3fffe5,0x3fffe6,0x7ffff1,0x3ffffe0,0x3ffffe1,0xfffeb,0x7fff1,0x3fffe7,0x7ffff2,0x3fffe8,0x1ffffec,0x3ffffe2,0x3ffffe3,0x3ffffe4,0x7ffffde,0x7ffffdf,0x3ffffe5,0xfffff1,0x1ffffed,0x7fff2,0x1fffe3,0x3ffffe6,0x7ffffe0,0x7ffffe1,0x3ffffe7,0x7ffffe2,0xfffff2,0x1fffe4,0x1fffe5,0x3ffffe8,0x3ffffe9,0xffffffd,0x7ffffe3,0x7ffffe4,0x7ffffe5,0xfffec,0xfffff3,0xfffed,0x1fffe6,0x3fffe9,0x1fffe7,0x1fffe8,0x7ffff3,0x3fffea,0x3fffeb,0x1ffffee,0x1ffffef,0xfffff4,0xfffff5,0x3ffffea,0x7ffff4,0x3ffffeb,0x7ffffe6,0x3ffffec,0x3ffffed,0x7ffffe7,0x7ffffe8,0x7ffffe9,0x7ffffea,0x7ffffeb,0xffffffe,0x7ffffec,0x7ffffed,0x7ffffee,0x7ffffef,0x7fffff0,0x3ffffee,0x3fffffff,
];

#[rustfmt::skip]
const BITS: [u8; 257] = [
    13,23,28,28,28,28,28,28,28,24,30,28,28,30,28,28,28,28,28,28,28,28,30,28,28,28,28,28,28,28,28,28,6,10,10,12,13,6,8,11,10,10,8,11,8,6,6,6,5,5,5,6,6,6,6,6,6,6,7,8,15,6,11,10,13,6,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,8,7,8,13,19,13,14,6,15,5,6,5,6,5,6,6,6,5,7,7,6,6,6,5,6,7,6,5,5,6,7,7,7,7,7,15,11,14,13,28,20,22,20,20,22,22,22,23,22,23,23,23,23,23,20,23,20,20,22,23,20,23,23,23,23,21,22,23,22,23,23,20,22,21,20,22,22,23,23,21,23,22,22,20,21,22,23,23,21,21,22,21,23,22,23,23,20,22,22,22,23,22,22,23,26,26,20,19,22,23,22,25,26,26,26,27,27,26,20,25,19,21,26,27,27,26,27,20,21,21,26,26,28,27,27,27,20,20,20,21,22,21,21,23,22,22,25,25,20,20,26,23,26,27,26,26,27,27,27,27,27,28,27,27,27,27,27,26,30,0,
];

#[derive(Debug, Clone, Copy)]
enum Trie {
    Leaf(u16),
    Node(usize, usize), // indices into TRIE_NODES: [bit 0 child, bit 1 child]
}

/// Binary trie over the Huffman code space, built once at first use.
struct HuffmanTable {
    nodes: Vec<Trie>,
    root: usize,
}

impl HuffmanTable {
    fn build() -> Self {
        let mut nodes = vec![Trie::Node(usize::MAX, usize::MAX)];
        let root = 0;
        for (sym, (&code, &bits)) in CODES.iter().zip(BITS.iter()).enumerate() {
            let mut node = root;
            for i in (0..bits).rev() {
                let bit = ((code >> i) & 1) as u8;
                let (zero, one) = match nodes[node] {
                    Trie::Node(z, o) => (z, o),
                    Trie::Leaf(_) => unreachable!("huffman code is a prefix of another"),
                };
                let next = if bit == 0 { zero } else { one };
                let next = if next == usize::MAX {
                    nodes.push(Trie::Node(usize::MAX, usize::MAX));
                    let idx = nodes.len() - 1;
                    match &mut nodes[node] {
                        Trie::Node(z, o) => {
                            if bit == 0 {
                                *z = idx;
                            } else {
                                *o = idx;
                            }
                        }
                        Trie::Leaf(_) => unreachable!(),
                    }
                    idx
                } else {
                    next
                };
                node = next;
            }
            nodes[node] = Trie::Leaf(sym as u16);
        }
        Self { nodes, root }
    }
}

thread_local! {
    static TABLE: HuffmanTable = HuffmanTable::build();
}

/// Encodes `data` as a Huffman-coded byte string, padded to a byte boundary
/// with 1-bits (a prefix of the EOS code, which is never itself emitted).
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut w = BitWriter::new();
    for &byte in data {
        let bits = BITS[byte as usize];
        let code = CODES[byte as usize];
        for i in (0..bits).rev() {
            w.write_bit(((code >> i) & 1) as u8);
        }
    }
    w.pad_with_ones();
    w.into_bytes()
}

pub fn encoded_len(data: &[u8]) -> usize {
    let bits: u64 = data.iter().map(|&b| u64::from(BITS[b as usize])).sum();
    ((bits + 7) / 8) as usize
}

/// Decodes a Huffman-coded byte string read up to (but not past) `limit`
/// bytes from the start of `reader`'s current position.
pub fn decode(reader: &mut BitReader<'_>, limit: usize) -> Result<Vec<u8>, HuffmanError> {
    TABLE.with(|table| {
        let mut out = Vec::new();
        let mut node = table.root;
        let mut bits_since_leaf = 0u32;
        let start_bit = reader.bits_consumed();
        let end_bit = start_bit + limit * 8;
        while reader.bits_consumed() < end_bit {
            let bit = reader.read_bit().map_err(|_| HuffmanError::UnexpectedEnd)?;
            bits_since_leaf += 1;
            node = match table.nodes[node] {
                Trie::Node(zero, one) => {
                    let next = if bit == 0 { zero } else { one };
                    if next == usize::MAX {
                        return Err(HuffmanError::InvalidCode);
                    }
                    next
                }
                Trie::Leaf(_) => unreachable!(),
            };
            if let Trie::Leaf(sym) = table.nodes[node] {
                if sym as usize == EOS {
                    return Err(HuffmanError::InvalidCode);
                }
                out.push(sym as u8);
                node = table.root;
                bits_since_leaf = 0;
            }
        }
        // Whatever bits remain on the path from root to `node` must be a
        // strict prefix of some code (i.e. all 1s, the EOS prefix) and no
        // more than 7 bits, per RFC 7541 §5.2.
        if node != table.root {
            if bits_since_leaf > 7 {
                return Err(HuffmanError::PaddingTooLong);
            }
            let mut probe = table.root;
            for _ in 0..bits_since_leaf {
                probe = match table.nodes[probe] {
                    Trie::Node(_, one) if one != usize::MAX => one,
                    _ => return Err(HuffmanError::InvalidPaddingBit),
                };
            }
            if probe != node {
                return Err(HuffmanError::InvalidPaddingBit);
            }
        }
        Ok(out)
    })
}
