//! Pending handshake state

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::protocol::address::AddressKind;
use crate::protocol::messages::{COOKIE_SIZE, TAG_SIZE};
use crate::session::SessionHandle;

/// Which side of the handshake this record plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// One pending handshake. Lives in the engine's table, indexed by tag and
/// (once the responder has answered) by cookie; the indexed keys are kept
/// on the record itself so removal can clean both maps.
pub struct HandshakeRecord {
    pub role: HandshakeRole,
    /// Weak back-reference to the owning session; `None` for a responder
    /// record created before any session exists.
    pub session: Option<Weak<RefCell<dyn SessionHandle>>>,
    /// Whether this handshake targets a peer rather than the rendezvous
    /// server.
    pub is_p2p: bool,
    /// Rendezvous server address (initiator retransmissions go here).
    pub host_address: Option<SocketAddr>,
    /// Candidate peer addresses, deduplicated by address. Grows from the
    /// constructor and from 0x71 redirections, never shrinks.
    candidates: BTreeMap<SocketAddr, AddressKind>,
    pub tag: [u8; TAG_SIZE],
    /// Present once the responder has issued a 0x70.
    pub cookie: Option<[u8; COOKIE_SIZE]>,
    pub local_public_key: Vec<u8>,
    pub far_public_key: Vec<u8>,
    pub local_nonce: Vec<u8>,
    pub far_nonce: Vec<u8>,
    /// Retransmission counter for 0x30.
    pub attempt: u8,
    pub last_attempt: Option<Instant>,
    /// Far peer ID, derived on the responder side from the 0x38 key block.
    pub peer_id: Option<[u8; 32]>,
}

impl HandshakeRecord {
    pub fn new_initiator(
        session: Weak<RefCell<dyn SessionHandle>>,
        tag: [u8; TAG_SIZE],
        host_address: SocketAddr,
        candidates: &[(SocketAddr, AddressKind)],
        is_p2p: bool,
    ) -> Self {
        let mut record = Self {
            role: HandshakeRole::Initiator,
            session: Some(session),
            is_p2p,
            host_address: Some(host_address),
            candidates: BTreeMap::new(),
            tag,
            cookie: None,
            local_public_key: Vec::new(),
            far_public_key: Vec::new(),
            local_nonce: Vec::new(),
            far_nonce: Vec::new(),
            attempt: 0,
            last_attempt: None,
            peer_id: None,
        };
        for (address, kind) in candidates {
            record.add_candidate(*address, *kind);
        }
        record
    }

    /// Responder record for an unsolicited 0x30: no session yet, requester
    /// is the only known candidate.
    pub fn new_responder(
        tag: [u8; TAG_SIZE],
        host_address: SocketAddr,
        requester: SocketAddr,
    ) -> Self {
        let mut candidates = BTreeMap::new();
        candidates.insert(requester, AddressKind::Public);
        Self {
            role: HandshakeRole::Responder,
            session: None,
            is_p2p: true,
            host_address: Some(host_address),
            candidates,
            tag,
            cookie: None,
            local_public_key: Vec::new(),
            far_public_key: Vec::new(),
            local_nonce: Vec::new(),
            far_nonce: Vec::new(),
            attempt: 0,
            last_attempt: None,
            peer_id: None,
        }
    }

    /// Insert a candidate address; returns whether it was new.
    pub fn add_candidate(&mut self, address: SocketAddr, kind: AddressKind) -> bool {
        self.candidates.insert(address, kind).is_none()
    }

    pub fn has_candidate(&self, address: &SocketAddr) -> bool {
        self.candidates.contains_key(address)
    }

    pub fn candidates(&self) -> impl Iterator<Item = (SocketAddr, AddressKind)> + '_ {
        self.candidates.iter().map(|(a, k)| (*a, *k))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Upgrade the session back-reference.
    pub fn session(&self) -> Option<Rc<RefCell<dyn SessionHandle>>> {
        self.session.as_ref().and_then(|weak| weak.upgrade())
    }

    /// A session was attached once but has since been dropped; the record
    /// is inert and will be reaped.
    pub fn session_dead(&self) -> bool {
        matches!(&self.session, Some(weak) if weak.upgrade().is_none())
    }

    /// Whether the retransmission schedule owes this record a send: never
    /// attempted, or the backoff window (attempt x base) has elapsed.
    pub fn due(&self, retry_interval: std::time::Duration) -> bool {
        if self.attempt == 0 {
            return true;
        }
        match self.last_attempt {
            Some(at) => at.elapsed() >= retry_interval * u32::from(self.attempt),
            None => true,
        }
    }

    pub fn mark_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }
}
