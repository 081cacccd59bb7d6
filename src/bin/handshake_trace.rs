//! In-process handshake trace
//!
//! Runs an initiator engine against a responder engine, shuttling every
//! emitted packet between them and printing the transcript plus the
//! derived session keys. Useful for eyeballing the wire layout.
//!
//! Engine-level logs follow `RUST_LOG`, e.g. `RUST_LOG=debug`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing_subscriber::{fmt, EnvFilter};

use rtmfp_handshake::crypto;
use rtmfp_handshake::handshake::SharedRecord;
use rtmfp_handshake::protocol::messages::p2p_epd;
use rtmfp_handshake::{
    EngineConfig, HandshakeEngine, HandshakeRecord, OutboundQueue, SessionHandle, SessionStatus,
};

struct TraceSession {
    name: String,
    peer_id: [u8; 32],
    target: [u8; 32],
    address: SocketAddr,
    tag: [u8; 16],
    session_id: u32,
    status: SessionStatus,
    self_weak: Option<Weak<RefCell<TraceSession>>>,
    record: Option<SharedRecord>,
    shared_secret: Option<Vec<u8>>,
    far_id: Option<u32>,
}

impl TraceSession {
    fn shared(
        name: &str,
        peer_id: [u8; 32],
        target: [u8; 32],
        address: SocketAddr,
        session_id: u32,
    ) -> Rc<RefCell<TraceSession>> {
        let mut tag = [0u8; 16];
        crypto::random_fill(&mut tag);
        let session = Rc::new(RefCell::new(TraceSession {
            name: name.to_string(),
            peer_id,
            target,
            address,
            tag,
            session_id,
            status: SessionStatus::Created,
            self_weak: None,
            record: None,
            shared_secret: None,
            far_id: None,
        }));
        session.borrow_mut().self_weak = Some(Rc::downgrade(&session));
        session
    }
}

impl SessionHandle for TraceSession {
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
    fn tag(&self) -> [u8; 16] {
        self.tag
    }
    fn session_id(&self) -> u32 {
        self.session_id
    }
    fn status(&self) -> SessionStatus {
        self.status
    }
    fn set_status(&mut self, status: SessionStatus) {
        println!("[{}] status -> {:?}", self.name, status);
        self.status = status;
    }
    fn on_peer_handshake_70(&mut self, peer: SocketAddr, far_key: &[u8], _cookie: &[u8]) -> bool {
        println!(
            "[{}] handshake 70 from {peer} ({}-byte far key)",
            self.name,
            far_key.len()
        );
        true
    }
    fn on_new_peer_id(
        &mut self,
        peer: SocketAddr,
        record: &Rc<RefCell<HandshakeRecord>>,
        far_id: u32,
        _raw_id: &[u8],
        peer_id_hex: &str,
    ) -> bool {
        println!("[{}] new peer {peer_id_hex} at {peer} (far id {far_id})", self.name);
        let weak: Weak<RefCell<dyn SessionHandle>> =
            self.self_weak.clone().expect("self weak set");
        record.borrow_mut().session = Some(weak);
        self.record = Some(record.clone());
        true
    }
    fn build_peer_id(&mut self, key_block: &[u8]) {
        self.peer_id = crypto::peer_id(key_block);
        println!("[{}] own peer id: {}", self.name, hex::encode(self.peer_id));
    }
    fn compute_keys(&mut self, far_id: u32, shared_secret: &[u8]) {
        self.far_id = Some(far_id);
        self.shared_secret = Some(shared_secret.to_vec());
        println!(
            "[{}] shared secret ({} bytes) for far id {far_id}",
            self.name,
            shared_secret.len()
        );
    }
    fn failed(&self) -> bool {
        false
    }
}

fn shuttle(
    label: &str,
    from: SocketAddr,
    queue: &mut OutboundQueue,
    receiver: &mut HandshakeEngine,
    receiver_queue: &mut OutboundQueue,
) -> usize {
    let packets = queue.drain();
    for (to, far_id, packet) in &packets {
        let kind = packet.get(5).copied().unwrap_or(0);
        println!(
            "{label} -> {to} type {kind:#04x} far id {far_id} ({} bytes)\n  {}",
            packet.len(),
            hex::encode(packet)
        );
        receiver.process(from, packet, receiver_queue);
    }
    packets.len()
}

fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let initiator_addr: SocketAddr = "127.0.0.1:19350".parse().expect("address");
    let responder_addr: SocketAddr = "127.0.0.1:19351".parse().expect("address");

    // The responder's identity; the initiator dials it by peer ID
    let responder_id = crypto::sha256(b"handshake-trace responder");
    let initiator = TraceSession::shared("initiator", [0; 32], responder_id, initiator_addr, 1);
    let responder = TraceSession::shared("responder", responder_id, [0; 32], responder_addr, 2);

    let dyn_initiator: Rc<RefCell<dyn SessionHandle>> = initiator.clone();
    let dyn_responder: Rc<RefCell<dyn SessionHandle>> = responder.clone();
    let mut initiator_engine =
        HandshakeEngine::new(EngineConfig::default(), Rc::downgrade(&dyn_initiator));
    let mut responder_engine =
        HandshakeEngine::new(EngineConfig::default(), Rc::downgrade(&dyn_responder));

    let mut initiator_out = OutboundQueue::new();
    let mut responder_out = OutboundQueue::new();

    let (record, _) = initiator_engine.start_handshake(&dyn_initiator, responder_addr, &[], true);
    initiator.borrow_mut().record = Some(record);
    initiator_engine.manage(&mut initiator_out);

    loop {
        let forward = shuttle(
            "initiator",
            initiator_addr,
            &mut initiator_out,
            &mut responder_engine,
            &mut responder_out,
        );
        let backward = shuttle(
            "responder",
            responder_addr,
            &mut responder_out,
            &mut initiator_engine,
            &mut initiator_out,
        );
        if forward == 0 && backward == 0 {
            break;
        }
    }

    let initiator_record = initiator.borrow().record.clone().expect("initiator record");
    let responder_record = responder.borrow().record.clone().expect("responder record");
    let initiator_nonce = initiator_record.borrow().local_nonce.clone();
    let responder_nonce = responder_record.borrow().local_nonce.clone();

    let initiator_shared = initiator.borrow().shared_secret.clone().expect("keys derived");
    let responder_shared = responder.borrow().shared_secret.clone().expect("keys derived");
    assert_eq!(initiator_shared, responder_shared, "DH agreement mismatch");

    let keys = crypto::derive_session_keys(&initiator_shared, &initiator_nonce, &responder_nonce)
        .expect("key derivation");
    println!("request key:  {}", hex::encode(keys.request_key));
    println!("response key: {}", hex::encode(keys.response_key));
    println!(
        "initiator status {:?}, responder far id {:?}",
        initiator.borrow().status,
        responder.borrow().far_id
    );
}
