//! RTMFP handshake wire protocol
//!
//! This module contains the on-the-wire pieces:
//! - The outer envelope shared by every handshake datagram
//! - Candidate address kinds and the 0x71 address-list codec
//! - Typed message bodies for 0x30/0x38/0x70/0x71/0x78

pub mod address;
pub mod envelope;
pub mod messages;

pub use address::{AddressKind, AddressList};
pub use envelope::{Envelope, HANDSHAKE_MARKER, MAX_PACKET_SIZE};
pub use messages::{
    Handshake30, Handshake38, Handshake70, Handshake71, Handshake78, ResponderKey, COOKIE_SIZE,
    TAG_SIZE,
};
