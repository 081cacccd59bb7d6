//! Cryptographic primitives for the handshake
//!
//! Diffie-Hellman key agreement, SHA-256 digests, peer ID derivation and
//! the asymmetric session-key ladder.

pub mod dh;

pub use dh::{DhKeyPair, DhProvider, DH_KEY_SIZE};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Peer IDs are SHA-256 digests.
pub const PEER_ID_SIZE: usize = 32;

/// Two-byte prefix of the raw (wire) form of a peer ID.
pub const RAW_ID_PREFIX: [u8; 2] = [0x21, 0x0F];

/// Initiator nonce: 5-byte prefix, 64 random bytes, 7-byte suffix (76 total).
pub const INITIATOR_NONCE_SIZE: usize = 76;
const INITIATOR_NONCE_PREFIX: [u8; 5] = [0x02, 0x1D, 0x02, 0x41, 0x0E];
const INITIATOR_NONCE_SUFFIX: [u8; 7] = [0x03, 0x1A, 0x02, 0x0A, 0x02, 0x1E, 0x02];

/// Responder nonce: 9-byte prefix, 64 random bytes (73 total).
pub const RESPONDER_NONCE_SIZE: usize = 73;
const RESPONDER_NONCE_PREFIX: [u8; 9] = [0x03, 0x1A, 0x00, 0x00, 0x02, 0x1E, 0x00, 0x41, 0x0E];

type HmacSha256 = Hmac<Sha256>;

/// Fill `buf` with fresh entropy.
pub fn random_fill(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

/// Derive a peer ID from the wire encoding of a public key block
/// (length varint, 0x1d02 signature and key bytes).
pub fn peer_id(key_block: &[u8]) -> [u8; PEER_ID_SIZE] {
    sha256(key_block)
}

/// Raw wire form of a peer ID: `21 0f` followed by the 32-byte digest.
pub fn raw_peer_id(id: &[u8; PEER_ID_SIZE]) -> [u8; PEER_ID_SIZE + 2] {
    let mut raw = [0u8; PEER_ID_SIZE + 2];
    raw[..2].copy_from_slice(&RAW_ID_PREFIX);
    raw[2..].copy_from_slice(id);
    raw
}

/// Fresh initiator nonce following the fixed template.
pub fn initiator_nonce() -> [u8; INITIATOR_NONCE_SIZE] {
    let mut nonce = [0u8; INITIATOR_NONCE_SIZE];
    nonce[..5].copy_from_slice(&INITIATOR_NONCE_PREFIX);
    random_fill(&mut nonce[5..69]);
    nonce[69..].copy_from_slice(&INITIATOR_NONCE_SUFFIX);
    nonce
}

/// Fresh responder nonce following the fixed template.
pub fn responder_nonce() -> [u8; RESPONDER_NONCE_SIZE] {
    let mut nonce = [0u8; RESPONDER_NONCE_SIZE];
    nonce[..9].copy_from_slice(&RESPONDER_NONCE_PREFIX);
    random_fill(&mut nonce[9..]);
    nonce
}

/// Symmetric keys derived at the end of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key protecting packets flowing initiator -> responder.
    pub request_key: [u8; 32],
    /// Key protecting packets flowing responder -> initiator.
    pub response_key: [u8; 32],
}

/// Derive the session keys from the DH shared secret and both nonces.
///
/// Each nonce first keys an HMAC over the other, then the shared secret
/// keys an HMAC over each intermediate digest.
pub fn derive_session_keys(
    shared_secret: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> Result<SessionKeys, CryptoError> {
    let m1 = hmac_sha256(responder_nonce, initiator_nonce)?;
    let m2 = hmac_sha256(initiator_nonce, responder_nonce)?;
    Ok(SessionKeys {
        request_key: hmac_sha256(shared_secret, &m1)?,
        response_key: hmac_sha256(shared_secret, &m2)?,
    })
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
