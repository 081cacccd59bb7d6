//! Outer handshake envelope
//!
//! Every handshake datagram shares one frame, network byte order:
//!
//! ```text
//! offset  size  meaning
//! 0       2     CRC slot (unvalidated on ingress, zero-filled on egress)
//! 2       1     marker; MUST be 0x0B
//! 3       2     echoed timestamp (4 ms units)
//! 5       1     type (0x30 | 0x38 | 0x70 | 0x71 | 0x78)
//! 6       2     body length
//! 8       N     body, then ignored padding
//! ```

use crate::codec::{Reader, Writer};
use crate::error::{HandshakeError, Result};

/// Marker byte shared by all handshake packets.
pub const HANDSHAKE_MARKER: u8 = 0x0B;

/// Envelope prefix before the type/length triplet.
pub const HEADER_SIZE: usize = 5;

/// Largest datagram the engine will emit.
pub const MAX_PACKET_SIZE: usize = 1192;

pub const KIND_30: u8 = 0x30;
pub const KIND_38: u8 = 0x38;
pub const KIND_70: u8 = 0x70;
pub const KIND_71: u8 = 0x71;
pub const KIND_78: u8 = 0x78;

/// A decoded handshake envelope borrowing the datagram.
#[derive(Debug)]
pub struct Envelope<'a> {
    pub echo_time: u16,
    pub kind: u8,
    pub body: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn decode(datagram: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(datagram);
        r.skip(2)?; // CRC slot, unvalidated

        let marker = r.read_u8()?;
        if marker != HANDSHAKE_MARKER {
            return Err(HandshakeError::UnexpectedMarker { marker }.into());
        }
        let echo_time = r.read_u16()?;
        let kind = r.read_u8()?;
        let length = r.read_u16()? as usize;
        r.shrink(length);
        let body = r.read_bytes(length)?;

        Ok(Self {
            echo_time,
            kind,
            body,
        })
    }
}

/// Reserve the envelope prefix plus the type/length triplet; the body is
/// written after this and `finish_packet` backfills the header.
pub fn begin_packet(w: &mut Writer) {
    w.reserve_zeroed(HEADER_SIZE + 3);
}

/// Backfill marker, timestamp and the type/length triplet. The CRC slot
/// stays zeroed.
pub fn finish_packet(w: &mut Writer, kind: u8, timestamp: u16) {
    let body_len = w.len() - HEADER_SIZE - 3;
    w.patch_u8(2, HANDSHAKE_MARKER);
    w.patch_u16(3, timestamp);
    w.patch_u8(HEADER_SIZE, kind);
    w.patch_u16(HEADER_SIZE + 1, body_len as u16);
}
