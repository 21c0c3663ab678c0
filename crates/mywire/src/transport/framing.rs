//! Packet framing.
//!
//! [`PacketCodec`] is sans-I/O: it turns payloads into length-prefixed
//! packets and back, tracking one sequence counter per exchange. The
//! async transport feeds it bytes as they arrive.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::{Error, InterfaceErrorKind, Result};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

#[derive(Debug, Clone)]
pub struct PacketCodec {
    sequence: u8,
    max_segment: usize,
    /// Adopt the peer's sequence ids instead of checking them.
    lenient: bool,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::with_max_segment(MAX_PACKET_SIZE)
    }

    /// Codec with a smaller segment size. The protocol fixes this at
    /// 2^24 - 1; smaller sizes exist so tests can exercise splitting.
    pub fn with_max_segment(max_segment: usize) -> Self {
        Self {
            sequence: 0,
            max_segment: max_segment.clamp(1, MAX_PACKET_SIZE),
            lenient: false,
        }
    }

    /// Sequence id the next packet (sent or received) must carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Start a new exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
    }

    pub fn max_segment(&self) -> usize {
        self.max_segment
    }

    /// Append `payload` to `out` as one or more packets.
    ///
    /// A payload that is an exact multiple of the segment size (including
    /// the empty payload) ends with an empty packet so the reader knows it
    /// is complete.
    pub fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let mut rest = payload;
        loop {
            let len = rest.len().min(self.max_segment);
            let header = PacketHeader {
                payload_length: len as u32,
                sequence_id: self.sequence,
            };
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(&rest[..len]);
            self.sequence = self.sequence.wrapping_add(1);
            rest = &rest[len..];
            if len < self.max_segment {
                break;
            }
        }
    }

    /// Take one logical packet off the front of `buf`.
    ///
    /// Returns `Ok(None)` until every fragment of the packet has arrived;
    /// nothing is consumed in that case.
    pub fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut offset = 0;
        let mut expected = self.sequence;
        let mut fragments = Vec::new();

        loop {
            let Some(header_bytes) = buf.get(offset..offset + PacketHeader::SIZE) else {
                return Ok(None);
            };
            let mut raw = [0u8; PacketHeader::SIZE];
            raw.copy_from_slice(header_bytes);
            let header = PacketHeader::from_bytes(&raw);
            let len = header.payload_length as usize;

            if header.sequence_id != expected {
                if !self.lenient {
                    return Err(Error::interface(
                        InterfaceErrorKind::Desync,
                        format!(
                            "Packets out of order: expected sequence {}, got {}",
                            expected, header.sequence_id
                        ),
                    ));
                }
                expected = header.sequence_id;
            }

            let start = offset + PacketHeader::SIZE;
            if buf.len() < start + len {
                return Ok(None);
            }
            fragments.push(start..start + len);
            offset = start + len;
            expected = expected.wrapping_add(1);

            if len < self.max_segment {
                break;
            }
        }

        let mut payload = Vec::with_capacity(fragments.iter().map(|r| r.len()).sum());
        for range in fragments {
            payload.extend_from_slice(&buf[range]);
        }
        buf.drain(..offset);
        self.sequence = expected;
        tracing::trace!(len = payload.len(), next_seq = expected, "packet decoded");
        Ok(Some(payload))
    }
}
