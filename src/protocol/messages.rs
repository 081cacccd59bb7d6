//! Handshake message bodies
//!
//! Typed encode/decode for the five handshake payloads:
//! - 0x30: connection request (endpoint descriptor + tag)
//! - 0x70: responder reply (tag echo, cookie, public key or certificate)
//! - 0x38: initiator answer (session id, cookie echo, key block, nonce)
//! - 0x78: responder finish (session id, nonce)
//! - 0x71: redirection / address exchange (tag echo, address list)
//!
//! The 0x38 body decodes in two stages: the prefix carries the cookie the
//! engine needs for its table lookup, and failures in the tail remove the
//! offending record rather than just dropping the packet.

use tracing::debug;

use crate::codec::{Reader, Writer};
use crate::error::{HandshakeError, Result};
use crate::protocol::address::{read_address_list, write_address_list, AddressList};

pub const TAG_SIZE: usize = 16;
pub const COOKIE_SIZE: usize = 64;

/// Fixed two-byte marker preceding a public-key blob.
pub const SIGNATURE_1D02: u16 = 0x1D02;

/// Terminator byte after a nonce.
pub const NONCE_END: u8 = 0x58;

/// Opaque certificate returned by a rendezvous server in 0x70.
pub const SERVER_CERT_SIZE: usize = 77;

fn read_tag(r: &mut Reader<'_>) -> Result<[u8; TAG_SIZE]> {
    let size = r.read_u8()?;
    if size as usize != TAG_SIZE {
        return Err(HandshakeError::malformed("tag size", format!("{size} (expected 16)")).into());
    }
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(r.read_bytes(TAG_SIZE)?);
    Ok(tag)
}

fn read_cookie(r: &mut Reader<'_>) -> Result<[u8; COOKIE_SIZE]> {
    let size = r.read_u8()?;
    if size as usize != COOKIE_SIZE {
        return Err(
            HandshakeError::malformed("cookie size", format!("{size} (expected 64)")).into(),
        );
    }
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie.copy_from_slice(r.read_bytes(COOKIE_SIZE)?);
    Ok(cookie)
}

/// 0x30 — connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake30 {
    /// Endpoint descriptor naming the connect target; opaque here, parsed
    /// with [`parse_p2p_epd`] on the responder side.
    pub epd: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Handshake30 {
    pub fn encode(&self, w: &mut Writer) {
        w.write_7bit_long_value(self.epd.len() as u64);
        w.write_bytes(&self.epd);
        w.write_bytes(&self.tag);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let epd_len = r.read_7bit_long_value()? as usize;
        let epd = r.read_bytes(epd_len)?.to_vec();
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(r.read_bytes(TAG_SIZE)?);
        Ok(Self { epd, tag })
    }
}

/// Extract the target peer ID from a P2P endpoint descriptor: a 34-byte
/// block of `7bv(33) | 0x0F | peer id (32)`.
pub fn parse_p2p_epd(epd: &[u8]) -> Result<[u8; 32]> {
    if epd.len() != 0x22 {
        return Err(HandshakeError::malformed(
            "endpoint descriptor",
            format!("{} bytes (expected 34)", epd.len()),
        )
        .into());
    }
    let mut r = Reader::new(epd);
    let inner = r.read_7bit_long_value()?;
    if inner != 0x21 {
        return Err(
            HandshakeError::malformed("endpoint descriptor", format!("inner size {inner}")).into(),
        );
    }
    let marker = r.read_u8()?;
    if marker != 0x0F {
        return Err(HandshakeError::malformed(
            "endpoint descriptor",
            format!("marker {marker:#04x} (expected 0x0f)"),
        )
        .into());
    }
    let mut peer_id = [0u8; 32];
    peer_id.copy_from_slice(r.read_bytes(32)?);
    Ok(peer_id)
}

/// Build the P2P endpoint descriptor addressing `peer_id`.
pub fn p2p_epd(peer_id: &[u8; 32]) -> Vec<u8> {
    let mut w = Writer::with_capacity(0x22);
    w.write_7bit_value(0x21);
    w.write_u8(0x0F);
    w.write_bytes(peer_id);
    w.into_inner()
}

/// Key material carried by a 0x70 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderKey {
    /// A peer's Diffie-Hellman public key (128 or 127 bytes).
    Peer(Vec<u8>),
    /// A rendezvous server's opaque 77-byte certificate.
    ServerCertificate(Vec<u8>),
}

/// 0x70 — responder reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake70 {
    pub tag: [u8; TAG_SIZE],
    pub cookie: [u8; COOKIE_SIZE],
    pub key: ResponderKey,
}

impl Handshake70 {
    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(TAG_SIZE as u8);
        w.write_bytes(&self.tag);
        w.write_u8(COOKIE_SIZE as u8);
        w.write_bytes(&self.cookie);
        match &self.key {
            ResponderKey::Peer(key) => {
                w.write_7bit_value(key.len() as u32 + 2);
                w.write_u16(SIGNATURE_1D02);
                w.write_bytes(key);
            }
            ResponderKey::ServerCertificate(cert) => w.write_bytes(cert),
        }
    }

    /// Stage 1: the echoed tag, enough for the engine's table lookup.
    pub fn decode_tag(r: &mut Reader<'_>) -> Result<[u8; TAG_SIZE]> {
        read_tag(r)
    }

    /// Stage 2: cookie plus key material; the layout depends on whether
    /// the pending handshake targets a peer or the rendezvous server.
    pub fn decode_body(
        r: &mut Reader<'_>,
        p2p: bool,
    ) -> Result<([u8; COOKIE_SIZE], ResponderKey)> {
        let cookie = read_cookie(r)?;
        let key = if p2p {
            let key_size = r
                .read_7bit_long_value()?
                .checked_sub(2)
                .ok_or_else(|| HandshakeError::malformed("responder key size", "under 2"))?;
            if key_size != 0x80 && key_size != 0x7F {
                return Err(HandshakeError::malformed(
                    "responder key size",
                    format!("{key_size} (expected 128 or 127)"),
                )
                .into());
            }
            let signature = r.read_u16()?;
            if signature != SIGNATURE_1D02 {
                return Err(HandshakeError::SignatureMismatch { found: signature }.into());
            }
            ResponderKey::Peer(r.read_bytes(key_size as usize)?.to_vec())
        } else {
            ResponderKey::ServerCertificate(r.read_bytes(SERVER_CERT_SIZE)?.to_vec())
        };
        Ok((cookie, key))
    }

    pub fn decode(r: &mut Reader<'_>, p2p: bool) -> Result<Self> {
        let tag = Self::decode_tag(r)?;
        let (cookie, key) = Self::decode_body(r, p2p)?;
        Ok(Self { tag, cookie, key })
    }
}

/// 0x38 — initiator answer. Encoding returns the span of the key block
/// (inner length varint, signature and key bytes) so the caller can derive
/// its own peer ID from the exact bytes put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake38 {
    pub session_id: u32,
    pub cookie: [u8; COOKIE_SIZE],
    pub public_key: Vec<u8>,
    pub nonce: [u8; 76],
}

/// Stage 1 of a 0x38: the far session id and the echoed cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake38Prefix {
    pub far_id: u32,
    pub cookie: [u8; COOKIE_SIZE],
}

impl Handshake38Prefix {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let far_id = r.read_u32()?;
        let cookie = read_cookie(r)?;
        Ok(Self { far_id, cookie })
    }
}

/// Stage 2 of a 0x38: key block and initiator nonce. Failures here remove
/// the pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake38Tail {
    pub public_key: Vec<u8>,
    /// The exact wire bytes the peer ID is derived from.
    pub key_block: Vec<u8>,
    pub nonce: [u8; 76],
}

impl Handshake38Tail {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let outer = r.read_7bit_value()?;
        if outer != 0x84 {
            debug!("Unusual outer key block size: {outer} (expected 132)");
        }
        let id_pos = r.position();
        let inner = r.read_7bit_value()?;
        if inner != 0x82 {
            debug!("Unusual inner key block size: {inner} (expected 130)");
        }
        let signature = r.read_u16()?;
        if signature != SIGNATURE_1D02 {
            return Err(HandshakeError::SignatureMismatch { found: signature }.into());
        }
        let key_size = inner
            .checked_sub(2)
            .ok_or_else(|| HandshakeError::malformed("inner key block size", "under 2"))?;
        let public_key = r.read_bytes(key_size as usize)?.to_vec();
        let key_block = r.window(id_pos, inner as usize + 2)?.to_vec();

        let nonce_size = r.read_7bit_value()?;
        if nonce_size != 0x4C {
            return Err(HandshakeError::malformed(
                "initiator nonce size",
                format!("{nonce_size} (expected 76)"),
            )
            .into());
        }
        let mut nonce = [0u8; 76];
        nonce.copy_from_slice(r.read_bytes(76)?);

        let end = r.read_u8()?;
        if end != NONCE_END {
            return Err(
                HandshakeError::malformed("end byte", format!("{end:#04x} (expected 0x58)")).into(),
            );
        }
        Ok(Self {
            public_key,
            key_block,
            nonce,
        })
    }
}

impl Handshake38 {
    /// Returns the key block span within the writer, for peer-ID
    /// derivation over the emitted bytes.
    pub fn encode(&self, w: &mut Writer) -> std::ops::Range<usize> {
        w.write_u32(self.session_id);
        w.write_7bit_long_value(COOKIE_SIZE as u64);
        w.write_bytes(&self.cookie);
        w.write_7bit_long_value(self.public_key.len() as u64 + 4);
        let id_pos = w.len();
        w.write_7bit_value(self.public_key.len() as u32 + 2);
        w.write_u16(SIGNATURE_1D02);
        w.write_bytes(&self.public_key);
        let key_block = id_pos..w.len();
        w.write_7bit_value(0x4C);
        w.write_bytes(&self.nonce);
        w.write_u8(NONCE_END);
        key_block
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<(Self, Vec<u8>)> {
        let prefix = Handshake38Prefix::decode(r)?;
        let tail = Handshake38Tail::decode(r)?;
        Ok((
            Self {
                session_id: prefix.far_id,
                cookie: prefix.cookie,
                public_key: tail.public_key,
                nonce: tail.nonce,
            },
            tail.key_block,
        ))
    }
}

/// 0x78 — responder finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake78 {
    pub session_id: u32,
    pub nonce: [u8; 73],
}

impl Handshake78 {
    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.session_id);
        w.write_u8(0x49);
        w.write_bytes(&self.nonce);
        w.write_u8(NONCE_END);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let session_id = r.read_u32()?;
        let nonce_size = r.read_u8()?;
        if nonce_size != 0x49 {
            return Err(HandshakeError::malformed(
                "responder nonce size",
                format!("{nonce_size} (expected 73)"),
            )
            .into());
        }
        let mut nonce = [0u8; 73];
        nonce.copy_from_slice(r.read_bytes(73)?);
        let end = r.read_u8()?;
        if end != NONCE_END {
            return Err(
                HandshakeError::malformed("end byte", format!("{end:#04x} (expected 0x58)")).into(),
            );
        }
        Ok(Self { session_id, nonce })
    }
}

/// 0x71 — redirection / address exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake71 {
    pub tag: [u8; TAG_SIZE],
    pub addresses: AddressList,
}

impl Handshake71 {
    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(TAG_SIZE as u8);
        w.write_bytes(&self.tag);
        write_address_list(w, &self.addresses);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let tag = read_tag(r)?;
        let addresses = read_address_list(r)?;
        Ok(Self { tag, addresses })
    }
}
