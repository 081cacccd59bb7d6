//! Error types for the RTMFP handshake engine

use thiserror::Error;

/// Main error type for the handshake engine
#[derive(Error, Debug)]
pub enum RtmfpError {
    /// Wire decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Handshake protocol errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading or writing wire fields
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer exhausted: {needed} bytes needed, {available} available")]
    Short { needed: usize, available: usize },

    #[error("Variable-length integer exceeds its {max_bytes}-byte bound")]
    VarintOverflow { max_bytes: usize },

    #[error("Position {position} is outside the buffer (length {length})")]
    OutOfBounds { position: usize, length: usize },
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// RNG or group setup failed; terminal for the endpoint
    #[error("Diffie-Hellman initialization failed: {reason}")]
    Init { reason: String },

    #[error("Invalid far public key length: {len}")]
    InvalidKeyLength { len: usize },

    #[error("Far public key is a trivial group element")]
    InvalidPublicKey,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Protocol-level handshake errors
///
/// Every inbound error is local: the engine logs it, drops the packet and
/// leaves unrelated handshakes untouched.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Unexpected handshake marker: {marker:#04x}")]
    UnexpectedMarker { marker: u8 },

    #[error("Unexpected handshake type: {kind:#04x}")]
    UnexpectedType { kind: u8 },

    #[error("Malformed {field}: {detail}")]
    MalformedField { field: &'static str, detail: String },

    #[error("No pending handshake for this tag (possible old request)")]
    StaleTag,

    #[error("No pending handshake for this cookie (possible old request)")]
    StaleCookie,

    #[error("Handshake received on the wrong role")]
    WrongRole,

    #[error("Peer ID does not match the local endpoint")]
    PeerIdMismatch,

    #[error("Expected signature 0x1d02 before public key, found {found:#06x}")]
    SignatureMismatch { found: u16 },

    #[error("Handshake abandoned after {attempts} attempts")]
    AttemptLimitReached { attempts: u8 },

    #[error("Owning session is gone")]
    SessionGone,
}

impl HandshakeError {
    /// Shorthand for size/format deviations in a named field
    pub fn malformed(field: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedField {
            field,
            detail: detail.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, RtmfpError>;
