//! The contract between the handshake engine and the session layer
//!
//! The engine owns no sockets and no sessions. Sessions implement
//! [`SessionHandle`] to supply identity material and to observe handshake
//! progress; emissions are handed to a [`PacketSink`] the caller passes
//! into `process`/`manage`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::handshake::record::HandshakeRecord;

/// Session-visible progress of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session exists, nothing sent yet.
    Created,
    /// At least one 0x30 is in flight.
    Sent30,
    /// A 0x70 was accepted and the 0x38 answer is out.
    Sent38,
    /// Keys are derived; the handshake record is gone.
    Connected,
    /// The attempt limit was reached without an answer.
    Failed,
}

impl SessionStatus {
    /// Whether the far side already answered our 0x30; late redirections
    /// are ignored once this holds.
    pub fn answered(&self) -> bool {
        matches!(self, Self::Sent38 | Self::Connected)
    }

    pub fn connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Callbacks the enclosing session layer provides to the engine.
///
/// One object usually serves as both the endpoint host (peer identity,
/// new-peer admission) and the per-connection session (tag, descriptor,
/// key computation); P2P responder sessions are adopted on the fly inside
/// [`SessionHandle::on_new_peer_id`].
pub trait SessionHandle {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// The local endpoint's 32-byte peer ID.
    fn peer_id(&self) -> [u8; 32];

    /// The local endpoint's public address.
    fn address(&self) -> SocketAddr;

    /// Endpoint descriptor to embed in outgoing 0x30 requests.
    fn epd(&self) -> Vec<u8>;

    /// The 16-byte tag chosen at session creation.
    fn tag(&self) -> [u8; 16];

    /// The 32-bit local session id.
    fn session_id(&self) -> u32;

    fn status(&self) -> SessionStatus;

    fn set_status(&mut self, status: SessionStatus);

    /// A 0x70 arrived for this session. Returning `true` proceeds with the
    /// 0x38 answer.
    fn on_peer_handshake_70(&mut self, peer: SocketAddr, far_key: &[u8], cookie: &[u8]) -> bool;

    /// A 0x38 completed peer-ID derivation on the responder side. The
    /// implementation may create or adopt a session and must attach it to
    /// `record` before returning `true`; returning `false` rejects the
    /// peer and removes the record.
    fn on_new_peer_id(
        &mut self,
        peer: SocketAddr,
        record: &Rc<RefCell<HandshakeRecord>>,
        far_id: u32,
        raw_id: &[u8],
        peer_id_hex: &str,
    ) -> bool;

    /// The engine emitted our key block inside a 0x38; `key_block` holds
    /// the exact wire bytes, so the session can derive the local peer ID
    /// the same way the far side will.
    fn build_peer_id(&mut self, key_block: &[u8]);

    /// Derive the symmetric session keys. `shared_secret` is the DH
    /// agreement output; both nonces are on the handshake record.
    fn compute_keys(&mut self, far_id: u32, shared_secret: &[u8]);

    /// Whether the session already failed; a failed session's packets are
    /// not processed.
    fn failed(&self) -> bool;
}

/// Where emitted packets go. `far_id` is non-zero for exactly one packet
/// per handshake: the 0x78 answer, which is addressed with the far
/// session id before any keys exist.
pub trait PacketSink {
    fn send(&mut self, to: SocketAddr, far_id: u32, packet: &[u8]);
}

/// Vec-backed sink used by the UDP pump and by tests.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    packets: Vec<(SocketAddr, u32, Vec<u8>)>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(SocketAddr, u32, Vec<u8>)> {
        std::mem::take(&mut self.packets)
    }
}

impl PacketSink for OutboundQueue {
    fn send(&mut self, to: SocketAddr, far_id: u32, packet: &[u8]) {
        self.packets.push((to, far_id, packet.to_vec()));
    }
}
