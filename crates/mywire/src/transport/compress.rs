//! Compressed protocol envelope.
//!
//! Once CLIENT_COMPRESS is negotiated, the framed packet stream is wrapped
//! in a second envelope with a 7-byte header:
//!
//! - 3 bytes: length of the (possibly compressed) body
//! - 1 byte: compressed sequence id
//! - 3 bytes: length before compression, or 0 if the body is stored as-is
//!
//! One body may carry several logical packets, or part of one.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use mywire_core::{Error, InterfaceErrorKind, Result};

use crate::protocol::MAX_PACKET_SIZE;

/// Bodies up to this many bytes are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

pub const COMPRESSED_HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Default)]
pub struct CompressedCodec {
    sequence: u8,
}

impl CompressedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Wrap already-framed packet bytes into compressed envelopes.
    pub fn encode(&mut self, framed: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for chunk in framed.chunks(MAX_PACKET_SIZE) {
            if chunk.len() > MIN_COMPRESS_LENGTH {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(chunk)?;
                let body = encoder.finish()?;
                self.write_header(out, body.len(), chunk.len());
                out.extend_from_slice(&body);
                tracing::trace!(raw = chunk.len(), compressed = body.len(), "compressed block");
            } else {
                self.write_header(out, chunk.len(), 0);
                out.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn write_header(&mut self, out: &mut Vec<u8>, body_len: usize, raw_len: usize) {
        out.extend_from_slice(&(body_len as u32).to_le_bytes()[..3]);
        out.push(self.sequence);
        out.extend_from_slice(&(raw_len as u32).to_le_bytes()[..3]);
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Take one compressed envelope off `buf` and return its inflated body.
    ///
    /// Returns `Ok(None)` if the envelope has not fully arrived.
    pub fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        if buf.len() < COMPRESSED_HEADER_SIZE {
            return Ok(None);
        }
        let body_len = u24(&buf[0..3]);
        let sequence = buf[3];
        let raw_len = u24(&buf[4..7]);
        if buf.len() < COMPRESSED_HEADER_SIZE + body_len {
            return Ok(None);
        }

        if sequence != self.sequence {
            return Err(Error::interface(
                InterfaceErrorKind::Desync,
                format!(
                    "Compressed packets out of order: expected sequence {}, got {}",
                    self.sequence, sequence
                ),
            ));
        }
        self.sequence = sequence.wrapping_add(1);

        let body: Vec<u8> = buf
            .drain(..COMPRESSED_HEADER_SIZE + body_len)
            .skip(COMPRESSED_HEADER_SIZE)
            .collect();
        if raw_len == 0 {
            return Ok(Some(body));
        }

        let mut inflated = Vec::with_capacity(raw_len);
        ZlibDecoder::new(body.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| {
                Error::interface(
                    InterfaceErrorKind::Protocol,
                    format!("Failed to decompress packet: {}", e),
                )
            })?;
        if inflated.len() != raw_len {
            return Err(Error::interface(
                InterfaceErrorKind::Protocol,
                format!(
                    "Compressed packet inflated to {} bytes, header said {}",
                    inflated.len(),
                    raw_len
                ),
            ));
        }
        Ok(Some(inflated))
    }
}

fn u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | usize::from(bytes[1]) << 8 | usize::from(bytes[2]) << 16
}
