//! The handshake state machine
//!
//! Drives the five handshake packet types end to end:
//!
//! - Initiator: `start_handshake` -> 0x30 out (retransmitted by
//!   [`HandshakeEngine::manage`]) -> 0x70 in -> 0x38 out -> 0x78 in ->
//!   keys derived, record dropped.
//! - Responder: 0x30 in -> 0x70 out with a fresh cookie -> 0x38 in ->
//!   peer ID derived, session adopted -> 0x78 out -> keys derived, record
//!   dropped.
//!
//! Everything runs to completion on the caller's thread; emissions are
//! pushed into the provided [`PacketSink`] before each handler returns.
//! Inbound errors are local: the packet is dropped, at worst the offending
//! record is removed, and no other handshake is disturbed.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::codec::{Reader, Writer};
use crate::config::EngineConfig;
use crate::crypto::{self, DhProvider};
use crate::error::{HandshakeError, Result, RtmfpError};
use crate::handshake::record::{HandshakeRecord, HandshakeRole};
use crate::handshake::table::{PendingTable, SharedRecord};
use crate::protocol::address::AddressKind;
use crate::protocol::envelope::{
    begin_packet, finish_packet, Envelope, KIND_30, KIND_38, KIND_70, KIND_71, KIND_78,
    MAX_PACKET_SIZE,
};
use crate::protocol::messages::{
    parse_p2p_epd, Handshake30, Handshake38, Handshake38Prefix, Handshake38Tail, Handshake70,
    Handshake71, Handshake78, ResponderKey, COOKIE_SIZE, TAG_SIZE,
};
use crate::session::{PacketSink, SessionHandle, SessionStatus};

/// One handshake engine serves one endpoint, shared by all of its
/// concurrent sessions.
pub struct HandshakeEngine {
    config: EngineConfig,
    host: Weak<RefCell<dyn SessionHandle>>,
    table: PendingTable,
    dh: DhProvider,
    epoch: Instant,
    last_echo: u16,
}

impl HandshakeEngine {
    pub fn new(config: EngineConfig, host: Weak<RefCell<dyn SessionHandle>>) -> Self {
        Self {
            config,
            host,
            table: PendingTable::new(),
            dh: DhProvider::new(),
            epoch: Instant::now(),
            last_echo: 0,
        }
    }

    /// Timestamp echoed by the most recent inbound handshake packet.
    pub fn last_echo(&self) -> u16 {
        self.last_echo
    }

    /// Number of pending handshakes.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn find_by_tag(&self, tag: &[u8; TAG_SIZE]) -> Option<SharedRecord> {
        self.table.find_by_tag(tag)
    }

    /// Feed one inbound datagram. Malformed or stale packets are logged
    /// and dropped without disturbing other handshakes.
    pub fn process(&mut self, from: SocketAddr, datagram: &[u8], out: &mut dyn PacketSink) {
        if self.host.upgrade().map_or(true, |h| h.borrow().failed()) {
            trace!("Endpoint host gone or failed, ignoring datagram from {from}");
            return;
        }
        if let Err(err) = self.dispatch(from, datagram, out) {
            log_dropped(&err, from);
        }
    }

    fn dispatch(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let envelope = Envelope::decode(datagram)?;
        self.last_echo = envelope.echo_time;
        let mut r = Reader::new(envelope.body);
        match envelope.kind {
            KIND_30 => self.handle_30(from, &mut r, out),
            KIND_38 => self.handle_38(from, &mut r, out),
            KIND_70 => self.handle_70(from, &mut r, out),
            KIND_71 => self.handle_71(from, &mut r, out),
            KIND_78 => self.handle_78(from, &mut r),
            kind => Err(HandshakeError::UnexpectedType { kind }.into()),
        }
    }

    /// Begin an outgoing handshake for `session`. The first 0x30 goes out
    /// on the next [`HandshakeEngine::manage`] tick. Returns the pending
    /// record and whether it was freshly created; a second call with the
    /// same tag yields the existing record.
    pub fn start_handshake(
        &mut self,
        session: &Rc<RefCell<dyn SessionHandle>>,
        address: SocketAddr,
        candidates: &[(SocketAddr, AddressKind)],
        is_p2p: bool,
    ) -> (SharedRecord, bool) {
        let tag = session.borrow().tag();
        let fresh = Rc::new(RefCell::new(HandshakeRecord::new_initiator(
            Rc::downgrade(session),
            tag,
            address,
            candidates,
            is_p2p,
        )));
        let (record, inserted) = self.table.insert_by_tag(tag, fresh);
        if !inserted {
            warn!("Handshake already exists, nothing done");
        }
        (record, inserted)
    }

    /// Remove a pending handshake from both indices. Idempotent.
    pub fn remove(&mut self, record: &SharedRecord) {
        self.table.remove(record);
    }

    /// Drop every pending handshake.
    pub fn close(&mut self) {
        self.table.close();
    }

    /// Retransmission tick. Walks the pending table once: reaps records
    /// whose session is gone, skips records the responder already answered
    /// (cookie set), and re-sends 0x30 for due initiator records on the
    /// `attempt x retry_interval` backoff. Reaching the attempt limit
    /// removes the record and fails the session.
    pub fn manage(&mut self, out: &mut dyn PacketSink) {
        if self.host.upgrade().map_or(true, |h| h.borrow().failed()) {
            return;
        }
        for tag in self.table.tags() {
            let Some(record) = self.table.find_by_tag(&tag) else {
                continue;
            };
            if record.borrow().session_dead() {
                debug!("Reaping handshake whose session is gone");
                self.remove(&record);
                continue;
            }
            if record.borrow().cookie.is_some() {
                continue;
            }
            let Some(session) = record.borrow().session() else {
                continue;
            };
            if session.borrow().status().answered() {
                continue; // 0x38 in flight or past handshake
            }
            if !record.borrow().due(self.config.retry_interval) {
                continue;
            }

            let attempt = {
                let mut rec = record.borrow_mut();
                rec.attempt += 1;
                rec.attempt
            };
            let name = session.borrow().name().to_string();
            if attempt >= self.config.max_attempts {
                debug!(
                    "Closing handshake with {name}: {}",
                    HandshakeError::AttemptLimitReached {
                        attempts: attempt - 1
                    }
                );
                self.remove(&record);
                session.borrow_mut().set_status(SessionStatus::Failed);
                continue;
            }

            debug!(
                "Sending handshake 30 to {name} ({attempt}/{})",
                self.config.max_attempts - 1
            );
            let epd = session.borrow().epd();
            let (host_address, is_p2p) = {
                let rec = record.borrow();
                (rec.host_address, rec.is_p2p)
            };
            if let Some(host) = host_address {
                self.emit_30(&epd, &tag, host, out);
            }
            if !is_p2p {
                let targets: Vec<SocketAddr> =
                    record.borrow().candidates().map(|(a, _)| a).collect();
                for target in targets {
                    self.emit_30(&epd, &tag, target, out);
                }
            }
            record.borrow_mut().mark_attempt();
            if attempt == 1 {
                session.borrow_mut().set_status(SessionStatus::Sent30);
            }
        }
    }

    /// Answer a 0x30 (or a session-layer request) with a 0x70. Creates the
    /// responder record on first use; repeats only add the requester as a
    /// candidate address.
    pub fn send_handshake_70(
        &mut self,
        tag: [u8; TAG_SIZE],
        address: SocketAddr,
        host_address: SocketAddr,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let record = match self.table.find_by_tag(&tag) {
            Some(record) => {
                record
                    .borrow_mut()
                    .add_candidate(address, AddressKind::Public);
                record
            }
            None => {
                let fresh = Rc::new(RefCell::new(HandshakeRecord::new_responder(
                    tag,
                    host_address,
                    address,
                )));
                let (record, _) = self.table.insert_by_tag(tag, fresh);
                trace!("Created responder handshake for tag {}", hex::encode(tag));
                record
            }
        };
        self.emit_70(&record, address, out)
    }

    fn handle_30(
        &mut self,
        from: SocketAddr,
        r: &mut Reader<'_>,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let msg = Handshake30::decode(r)?;
        let target = parse_p2p_epd(&msg.epd)?;
        let host = self.host.upgrade().ok_or(HandshakeError::SessionGone)?;
        let (local_id, local_address) = {
            let h = host.borrow();
            (h.peer_id(), h.address())
        };
        if target != local_id {
            return Err(HandshakeError::PeerIdMismatch.into());
        }
        self.send_handshake_70(msg.tag, from, local_address, out)
    }

    fn handle_70(
        &mut self,
        from: SocketAddr,
        r: &mut Reader<'_>,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let tag = Handshake70::decode_tag(r)?;
        let record = self
            .table
            .find_by_tag(&tag)
            .ok_or(HandshakeError::StaleTag)?;
        if record.borrow().role != HandshakeRole::Initiator {
            return Err(HandshakeError::WrongRole.into());
        }
        let session = record
            .borrow()
            .session()
            .ok_or(HandshakeError::SessionGone)?;

        let is_p2p = record.borrow().is_p2p;
        let (cookie, key) = Handshake70::decode_body(r, is_p2p)?;
        match key {
            ResponderKey::Peer(key) => record.borrow_mut().far_public_key = key,
            ResponderKey::ServerCertificate(cert) => {
                debug!("Server certificate: {}", hex::encode(&cert));
            }
        }

        let far_key = record.borrow().far_public_key.clone();
        let proceed = session
            .borrow_mut()
            .on_peer_handshake_70(from, &far_key, &cookie);
        if proceed {
            self.emit_38(&record, &session, &cookie, from, out)?;
        }
        Ok(())
    }

    fn handle_38(
        &mut self,
        from: SocketAddr,
        r: &mut Reader<'_>,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let prefix = Handshake38Prefix::decode(r)?;
        let record = self
            .table
            .find_by_cookie(&prefix.cookie)
            .ok_or(HandshakeError::StaleCookie)?;

        // Framing violations past this point discard the handshake itself
        let tail = match Handshake38Tail::decode(r) {
            Ok(tail) => tail,
            Err(err) => {
                self.remove(&record);
                return Err(err);
            }
        };

        let id = crypto::peer_id(&tail.key_block);
        let raw_id = crypto::raw_peer_id(&id);
        let id_hex = hex::encode(id);
        debug!("Peer ID derived from handshake 38 key block: {id_hex}");
        {
            let mut rec = record.borrow_mut();
            rec.far_public_key = tail.public_key.clone();
            rec.far_nonce = tail.nonce.to_vec();
            rec.peer_id = Some(id);
        }

        let host = self.host.upgrade().ok_or(HandshakeError::SessionGone)?;
        let accepted =
            host.borrow_mut()
                .on_new_peer_id(from, &record, prefix.far_id, &raw_id, &id_hex);
        if !accepted {
            debug!("Session layer rejected peer {id_hex}");
            self.remove(&record);
            return Ok(());
        }
        let session = record.borrow().session();
        let Some(session) = session else {
            warn!("No session attached after peer admission, removing handshake");
            self.remove(&record);
            return Err(HandshakeError::SessionGone.into());
        };

        let nonce = crypto::responder_nonce();
        record.borrow_mut().local_nonce = nonce.to_vec();
        let msg = Handshake78 {
            session_id: session.borrow().session_id(),
            nonce,
        };
        let mut w = Writer::with_capacity(MAX_PACKET_SIZE);
        begin_packet(&mut w);
        msg.encode(&mut w);
        finish_packet(&mut w, KIND_78, self.timestamp());
        // This one packet is addressed with the far session id; every
        // other emission goes out with far id 0.
        out.send(from, prefix.far_id, w.data());

        let shared = self.dh.keys()?.shared_secret(&tail.public_key)?;
        session.borrow_mut().compute_keys(prefix.far_id, &shared);
        self.remove(&record);
        Ok(())
    }

    fn handle_71(
        &mut self,
        from: SocketAddr,
        r: &mut Reader<'_>,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let msg = Handshake71::decode(r)?;
        let record = self
            .table
            .find_by_tag(&msg.tag)
            .ok_or(HandshakeError::StaleTag)?;
        let session = record
            .borrow()
            .session()
            .ok_or(HandshakeError::SessionGone)?;
        if session.borrow().status().answered() {
            debug!("Redirection from {from} ignored, the far side already answered");
            return Ok(());
        }

        let mut fresh = 0usize;
        {
            let mut rec = record.borrow_mut();
            for (address, kind) in &msg.addresses.candidates {
                if rec.add_candidate(*address, *kind) {
                    fresh += 1;
                }
            }
            if let Some(host) = msg.addresses.host {
                rec.host_address = Some(host);
            }
        }
        debug!(
            "Redirection carried {} addresses ({fresh} new)",
            msg.addresses.candidates.len()
        );

        if record.borrow().is_p2p {
            // The server handed us the responder's addresses; knock on all
            // of them right away rather than waiting for the tick
            let epd = session.borrow().epd();
            let targets: Vec<SocketAddr> = record.borrow().candidates().map(|(a, _)| a).collect();
            for target in targets {
                self.emit_30(&epd, &msg.tag, target, out);
            }
        } else {
            debug!("Server redirection, handshake 30 resumes on the next tick");
        }
        Ok(())
    }

    fn handle_78(&mut self, from: SocketAddr, r: &mut Reader<'_>) -> Result<()> {
        let msg = Handshake78::decode(r)?;
        // The 0x78 body carries no tag or cookie; correlate by sender
        // address among initiator handshakes awaiting exactly this answer.
        let record = self
            .table
            .records()
            .find(|rec| {
                let rec = rec.borrow();
                rec.role == HandshakeRole::Initiator
                    && (rec.host_address == Some(from) || rec.has_candidate(&from))
                    && rec
                        .session()
                        .is_some_and(|s| s.borrow().status() == SessionStatus::Sent38)
            })
            .cloned()
            .ok_or(HandshakeError::StaleTag)?;
        let session = record
            .borrow()
            .session()
            .ok_or(HandshakeError::SessionGone)?;

        record.borrow_mut().far_nonce = msg.nonce.to_vec();
        let far_key = record.borrow().far_public_key.clone();
        let shared = self.dh.keys()?.shared_secret(&far_key)?;
        session.borrow_mut().compute_keys(msg.session_id, &shared);
        session.borrow_mut().set_status(SessionStatus::Connected);
        debug!("Handshake with {} completed", session.borrow().name());
        self.remove(&record);
        Ok(())
    }

    fn emit_30(&self, epd: &[u8], tag: &[u8; TAG_SIZE], to: SocketAddr, out: &mut dyn PacketSink) {
        let msg = Handshake30 {
            epd: epd.to_vec(),
            tag: *tag,
        };
        let mut w = Writer::with_capacity(MAX_PACKET_SIZE);
        begin_packet(&mut w);
        msg.encode(&mut w);
        finish_packet(&mut w, KIND_30, self.timestamp());
        out.send(to, 0, w.data());
    }

    fn emit_70(
        &mut self,
        record: &SharedRecord,
        to: SocketAddr,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let cookie = record.borrow().cookie;
        let cookie = match cookie {
            Some(cookie) => cookie,
            None => {
                let mut fresh = [0u8; COOKIE_SIZE];
                crypto::random_fill(&mut fresh);
                self.table.bind_cookie(record, fresh);
                trace!("Issued cookie {}", hex::encode(fresh));
                fresh
            }
        };

        let public = self.dh.keys()?.public_key().to_vec();
        record.borrow_mut().local_public_key = public.clone();
        let msg = Handshake70 {
            tag: record.borrow().tag,
            cookie,
            key: ResponderKey::Peer(public),
        };
        let mut w = Writer::with_capacity(MAX_PACKET_SIZE);
        begin_packet(&mut w);
        msg.encode(&mut w);
        finish_packet(&mut w, KIND_70, self.timestamp());
        out.send(to, 0, w.data());
        Ok(())
    }

    fn emit_38(
        &mut self,
        record: &SharedRecord,
        session: &Rc<RefCell<dyn SessionHandle>>,
        cookie: &[u8; COOKIE_SIZE],
        to: SocketAddr,
        out: &mut dyn PacketSink,
    ) -> Result<()> {
        let public = self.dh.keys()?.public_key().to_vec();
        record.borrow_mut().local_public_key = public.clone();
        let nonce = crypto::initiator_nonce();
        let msg = Handshake38 {
            session_id: session.borrow().session_id(),
            cookie: *cookie,
            public_key: public,
            nonce,
        };

        let mut w = Writer::with_capacity(MAX_PACKET_SIZE);
        begin_packet(&mut w);
        let key_block = msg.encode(&mut w);
        // Hand the emitted key block to the session so it derives the
        // local peer ID from the same bytes the far side will hash
        session.borrow_mut().build_peer_id(&w.data()[key_block]);
        record.borrow_mut().local_nonce = nonce.to_vec();
        finish_packet(&mut w, KIND_38, self.timestamp());
        out.send(to, 0, w.data());
        session.borrow_mut().set_status(SessionStatus::Sent38);
        Ok(())
    }

    fn timestamp(&self) -> u16 {
        (self.epoch.elapsed().as_millis() / 4) as u16
    }
}

fn log_dropped(err: &RtmfpError, from: SocketAddr) {
    match err {
        RtmfpError::Handshake(HandshakeError::StaleTag | HandshakeError::StaleCookie) => {
            debug!("Dropped handshake packet from {from}: {err}");
        }
        RtmfpError::Handshake(
            HandshakeError::UnexpectedType { .. } | HandshakeError::SignatureMismatch { .. },
        )
        | RtmfpError::Crypto(_) => {
            error!("Dropped handshake packet from {from}: {err}");
        }
        _ => warn!("Dropped handshake packet from {from}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::p2p_epd;
    use crate::session::OutboundQueue;
    use std::time::Duration;

    struct TestSession {
        name: String,
        peer_id: [u8; 32],
        target: [u8; 32],
        address: SocketAddr,
        tag: [u8; TAG_SIZE],
        session_id: u32,
        status: SessionStatus,
        accept_70: bool,
        adopt_peer: bool,
        self_weak: Option<Weak<RefCell<TestSession>>>,
        computed: Option<(u32, Vec<u8>)>,
        own_key_block: Option<Vec<u8>>,
    }

    impl TestSession {
        fn shared(name: &str, tag_byte: u8, session_id: u32) -> Rc<RefCell<TestSession>> {
            let session = Rc::new(RefCell::new(TestSession {
                name: name.to_string(),
                peer_id: [0xAA; 32],
                target: [0xBB; 32],
                address: "127.0.0.1:1935".parse().unwrap(),
                tag: [tag_byte; TAG_SIZE],
                session_id,
                status: SessionStatus::Created,
                accept_70: true,
                adopt_peer: true,
                self_weak: None,
                computed: None,
                own_key_block: None,
            }));
            session.borrow_mut().self_weak = Some(Rc::downgrade(&session));
            session
        }
    }

    impl SessionHandle for TestSession {
        fn name(&self) -> &str {
            &self.name
        }
        fn peer_id(&self) -> [u8; 32] {
            self.peer_id
        }
        fn address(&self) -> SocketAddr {
            self.address
        }
        fn epd(&self) -> Vec<u8> {
            p2p_epd(&self.target)
        }
        fn tag(&self) -> [u8; TAG_SIZE] {
            self.tag
        }
        fn session_id(&self) -> u32 {
            self.session_id
        }
        fn status(&self) -> SessionStatus {
            self.status
        }
        fn set_status(&mut self, status: SessionStatus) {
            self.status = status;
        }
        fn on_peer_handshake_70(&mut self, _peer: SocketAddr, _far: &[u8], _cookie: &[u8]) -> bool {
            self.accept_70
        }
        fn on_new_peer_id(
            &mut self,
            _peer: SocketAddr,
            record: &Rc<RefCell<HandshakeRecord>>,
            _far_id: u32,
            _raw_id: &[u8],
            _peer_id_hex: &str,
        ) -> bool {
            if !self.adopt_peer {
                return false;
            }
            let weak: Weak<RefCell<dyn SessionHandle>> =
                self.self_weak.clone().expect("self weak set");
            record.borrow_mut().session = Some(weak);
            true
        }
        fn build_peer_id(&mut self, key_block: &[u8]) {
            self.own_key_block = Some(key_block.to_vec());
        }
        fn compute_keys(&mut self, far_id: u32, shared_secret: &[u8]) {
            self.computed = Some((far_id, shared_secret.to_vec()));
        }
        fn failed(&self) -> bool {
            false
        }
    }

    fn engine_for(host: &Rc<RefCell<TestSession>>) -> HandshakeEngine {
        let config = EngineConfig {
            retry_interval: Duration::ZERO,
            max_attempts: 12,
        };
        let dyn_host: Rc<RefCell<dyn SessionHandle>> = host.clone();
        HandshakeEngine::new(config, Rc::downgrade(&dyn_host))
    }

    fn packet(kind: u8, body: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut w = Writer::new();
        begin_packet(&mut w);
        body(&mut w);
        finish_packet(&mut w, kind, 0);
        w.into_inner()
    }

    fn addr(last: u8) -> SocketAddr {
        format!("192.0.2.{last}:1935").parse().unwrap()
    }

    #[test]
    fn test_handshake30_wrong_peer_id_creates_nothing() {
        let host = TestSession::shared("local", 1, 10);
        let mut engine = engine_for(&host);
        let mut out = OutboundQueue::new();

        let mut wrong = host.borrow().peer_id();
        wrong[5] ^= 0x01;
        let datagram = packet(KIND_30, |w| {
            Handshake30 {
                epd: p2p_epd(&wrong),
                tag: [7; TAG_SIZE],
            }
            .encode(w)
        });
        engine.process(addr(1), &datagram, &mut out);

        assert!(out.is_empty());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_handshake30_answered_with_70() {
        let host = TestSession::shared("local", 1, 10);
        let mut engine = engine_for(&host);
        let mut out = OutboundQueue::new();

        let local_id = host.borrow().peer_id();
        let tag = [7u8; TAG_SIZE];
        let datagram = packet(KIND_30, |w| {
            Handshake30 {
                epd: p2p_epd(&local_id),
                tag,
            }
            .encode(w)
        });
        engine.process(addr(1), &datagram, &mut out);

        let sent = out.drain();
        assert_eq!(sent.len(), 1);
        let (to, far_id, bytes) = &sent[0];
        assert_eq!(*to, addr(1));
        assert_eq!(*far_id, 0);
        let envelope = Envelope::decode(bytes).unwrap();
        assert_eq!(envelope.kind, KIND_70);
        let reply = Handshake70::decode(&mut Reader::new(envelope.body), true).unwrap();
        assert_eq!(reply.tag, tag);

        let record = engine.find_by_tag(&tag).unwrap();
        assert_eq!(record.borrow().role, HandshakeRole::Responder);
        assert_eq!(record.borrow().cookie, Some(reply.cookie));
    }

    #[test]
    fn test_stale_70_dropped() {
        let host = TestSession::shared("local", 1, 10);
        let mut engine = engine_for(&host);
        let mut out = OutboundQueue::new();

        let datagram = packet(KIND_70, |w| {
            Handshake70 {
                tag: [9; TAG_SIZE],
                cookie: [1; COOKIE_SIZE],
                key: ResponderKey::Peer(vec![0x44; 128]),
            }
            .encode(w)
        });
        engine.process(addr(2), &datagram, &mut out);
        assert!(out.is_empty());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_start_handshake_twice_returns_existing() {
        let host = TestSession::shared("local", 3, 10);
        let mut engine = engine_for(&host);
        let dyn_host: Rc<RefCell<dyn SessionHandle>> = host.clone();

        let (first, created) = engine.start_handshake(&dyn_host, addr(9), &[], false);
        assert!(created);
        let (second, created) = engine.start_handshake(&dyn_host, addr(9), &[], false);
        assert!(!created);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn test_retry_schedule_fails_at_attempt_limit() {
        let host = TestSession::shared("local", 4, 10);
        let mut engine = engine_for(&host);
        let dyn_host: Rc<RefCell<dyn SessionHandle>> = host.clone();
        let mut out = OutboundQueue::new();

        engine.start_handshake(&dyn_host, addr(9), &[], false);

        // Sends happen at counter values 1..=11
        for attempt in 1..=11u8 {
            engine.manage(&mut out);
            assert_eq!(out.drain().len(), 1, "attempt {attempt}");
        }
        assert_eq!(host.borrow().status, SessionStatus::Sent30);

        // The 12th eligibility removes instead of sending
        engine.manage(&mut out);
        assert!(out.is_empty());
        assert_eq!(engine.pending(), 0);
        assert_eq!(host.borrow().status, SessionStatus::Failed);
    }

    #[test]
    fn test_redirection_merges_and_knocks_p2p() {
        let host = TestSession::shared("local", 5, 10);
        let mut engine = engine_for(&host);
        let dyn_host: Rc<RefCell<dyn SessionHandle>> = host.clone();
        let mut out = OutboundQueue::new();

        let (record, _) = engine.start_handshake(&dyn_host, addr(9), &[], true);
        let tag = host.borrow().tag;
        let datagram = packet(KIND_71, |w| {
            Handshake71 {
                tag,
                addresses: crate::protocol::address::AddressList {
                    candidates: vec![
                        (addr(21), AddressKind::Public),
                        (addr(22), AddressKind::Local),
                    ],
                    host: Some(addr(30)),
                },
            }
            .encode(w)
        });
        engine.process(addr(9), &datagram, &mut out);

        assert_eq!(record.borrow().candidate_count(), 2);
        assert_eq!(record.borrow().host_address, Some(addr(30)));
        // P2P knocks on every candidate immediately
        let sent = out.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, _, bytes)| {
            Envelope::decode(bytes).unwrap().kind == KIND_30
        }));
    }

    #[test]
    fn test_late_redirection_ignored() {
        let host = TestSession::shared("local", 6, 10);
        let mut engine = engine_for(&host);
        let dyn_host: Rc<RefCell<dyn SessionHandle>> = host.clone();
        let mut out = OutboundQueue::new();

        let (record, _) = engine.start_handshake(&dyn_host, addr(9), &[], true);
        host.borrow_mut().status = SessionStatus::Sent38;

        let tag = host.borrow().tag;
        let datagram = packet(KIND_71, |w| {
            Handshake71 {
                tag,
                addresses: crate::protocol::address::AddressList {
                    candidates: vec![(addr(21), AddressKind::Public)],
                    host: None,
                },
            }
            .encode(w)
        });
        engine.process(addr(9), &datagram, &mut out);

        assert_eq!(record.borrow().candidate_count(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_handshake38_bad_signature_removes_record() {
        let host = TestSession::shared("local", 1, 10);
        let mut engine = engine_for(&host);
        let mut out = OutboundQueue::new();

        // Provoke a responder record + cookie with a valid 0x30
        let local_id = host.borrow().peer_id();
        let tag = [8u8; TAG_SIZE];
        let datagram = packet(KIND_30, |w| {
            Handshake30 {
                epd: p2p_epd(&local_id),
                tag,
            }
            .encode(w)
        });
        engine.process(addr(1), &datagram, &mut out);
        let cookie = engine
            .find_by_tag(&tag)
            .unwrap()
            .borrow()
            .cookie
            .expect("cookie issued");
        out.drain();

        let msg = Handshake38 {
            session_id: 77,
            cookie,
            public_key: vec![0x66; 128],
            nonce: [0; 76],
        };
        let mut body = Writer::new();
        let span = msg.encode(&mut body);
        let mut bytes = body.into_inner();
        bytes[span.start + 2] = 0xFF; // corrupt the signature
        let datagram = packet(KIND_38, |w| w.write_bytes(&bytes));
        engine.process(addr(1), &datagram, &mut out);

        assert!(out.is_empty());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_dead_session_reaped_on_tick() {
        let host = TestSession::shared("local", 2, 10);
        let mut engine = engine_for(&host);
        let mut out = OutboundQueue::new();

        {
            let orphan = TestSession::shared("orphan", 9, 11);
            let dyn_orphan: Rc<RefCell<dyn SessionHandle>> = orphan.clone();
            engine.start_handshake(&dyn_orphan, addr(9), &[], false);
            assert_eq!(engine.pending(), 1);
        }
        engine.manage(&mut out);
        assert_eq!(engine.pending(), 0);
        assert!(out.is_empty());
    }
}
