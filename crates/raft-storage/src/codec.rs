//! # codec
//!
//! why: frame arbitrary byte records into fixed-size blocks so damage stays local
//! relations: used by recorder.rs for every wal segment read and write
//! what: fragment header layout, record encoder, block-at-a-time record decoder
//!
//! layout of one fragment:
//!
//! ```text
//! +--------+-----------+-----------+------------+
//! | fin|op | len (u16) | crc (u32) | payload    |
//! | 1 byte | 2 bytes LE| 4 bytes LE| len bytes  |
//! +--------+-----------+-----------+------------+
//! ```
//!
//! fragments never straddle a block boundary. a block tail too short for a
//! header is zero filled and the next fragment starts on the next block.

use crate::error::CodecError;
use std::io::{self, Read};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 1 + 2 + 4;

const FIN_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0f;

/// Fragment kind, stored in the low bits of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Follow-up fragment of a record opened by an earlier one
    Continue = 0x0,
    /// First fragment of a record; 0x1 is never written and never accepted
    Binary = 0x2,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Self::Continue),
            0x2 => Some(Self::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub len: u16,
    pub crc: u32,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.opcode as u8 | if self.fin { FIN_BIT } else { 0 };
        out[1..3].copy_from_slice(&self.len.to_le_bytes());
        out[3..7].copy_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Parse a header; `None` for an unknown opcode
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Option<Self> {
        let opcode = Opcode::from_bits(bytes[0] & OPCODE_MASK)?;
        Some(Self {
            fin: bytes[0] & FIN_BIT != 0,
            opcode,
            len: u16::from_le_bytes([bytes[1], bytes[2]]),
            crc: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        })
    }
}

/// Frame `record` as it would land at byte `offset` of a stream, appending to `out`.
///
/// An empty record still produces one final, zero-length fragment.
/// Returns the number of bytes appended, padding included.
pub fn encode_record(offset: u64, record: &[u8], out: &mut Vec<u8>) -> usize {
    let before = out.len();
    let mut pos = offset;
    let mut rest = record;
    let mut opcode = Opcode::Binary;
    loop {
        let block_space = BLOCK_SIZE - (pos % BLOCK_SIZE as u64) as usize;
        if block_space < HEADER_SIZE {
            out.resize(out.len() + block_space, 0);
            pos += block_space as u64;
            continue;
        }
        let take = rest.len().min(block_space - HEADER_SIZE);
        let (payload, tail) = rest.split_at(take);
        let header = FragmentHeader {
            fin: tail.is_empty(),
            opcode,
            len: take as u16,
            crc: crc32fast::hash(payload),
        };
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(payload);
        pos += (HEADER_SIZE + take) as u64;
        rest = tail;
        opcode = Opcode::Continue;
        if rest.is_empty() {
            break;
        }
    }
    out.len() - before
}

/// Reassembles records from a framed stream, one block in memory at a time.
#[derive(Debug)]
pub struct RecordDecoder {
    block: Vec<u8>,
    block_len: usize,
    pos: usize,
    block_start: u64,
    valid_offset: u64,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self {
            block: vec![0; BLOCK_SIZE],
            block_len: 0,
            pos: 0,
            block_start: 0,
            valid_offset: 0,
        }
    }

    /// Offset just past the last complete record returned
    pub fn valid_offset(&self) -> u64 {
        self.valid_offset
    }

    /// Read the next record from `reader`.
    ///
    /// `Ok(None)` is a clean end of stream. Any torn or damaged fragment is
    /// `CodecError::Corrupt`; the stream is intact up to `valid_offset()`.
    pub fn next_record<R: Read>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>, CodecError> {
        let mut record: Option<Vec<u8>> = None;
        loop {
            if self.block_len - self.pos < HEADER_SIZE {
                let exhausted_full_block = self.block_len == 0 || self.block_len == BLOCK_SIZE;
                if exhausted_full_block && self.fill(reader)? {
                    continue;
                }
                if self.block_len == self.pos && record.is_none() {
                    return Ok(None);
                }
                return Err(self.corrupt("truncated fragment header"));
            }

            let mut raw = [0u8; HEADER_SIZE];
            raw.copy_from_slice(&self.block[self.pos..self.pos + HEADER_SIZE]);
            let header = FragmentHeader::decode(&raw).ok_or_else(|| self.corrupt("unknown opcode"))?;
            match (header.opcode, record.is_some()) {
                (Opcode::Continue, false) => {
                    return Err(self.corrupt("continuation without a first fragment"))
                }
                (Opcode::Binary, true) => {
                    return Err(self.corrupt("record interrupted before its final fragment"))
                }
                _ => {}
            }

            let start = self.pos + HEADER_SIZE;
            let end = start + header.len as usize;
            if end > self.block_len {
                return Err(self.corrupt("truncated fragment payload"));
            }
            let payload = &self.block[start..end];
            if crc32fast::hash(payload) != header.crc {
                return Err(self.corrupt("checksum mismatch"));
            }
            record.get_or_insert_with(Vec::new).extend_from_slice(payload);
            self.pos = end;

            if header.fin {
                self.valid_offset = self.block_start + self.pos as u64;
                return Ok(record);
            }
        }
    }

    /// Load the next block; false at end of stream
    fn fill<R: Read>(&mut self, reader: &mut R) -> io::Result<bool> {
        self.block_start += self.block_len as u64;
        self.pos = 0;
        self.block_len = read_full(reader, &mut self.block)?;
        Ok(self.block_len > 0)
    }

    fn corrupt(&self, reason: &'static str) -> CodecError {
        CodecError::Corrupt {
            offset: self.block_start + self.pos as u64,
            reason,
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
