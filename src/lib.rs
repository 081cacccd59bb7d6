//! RTMFP handshake engine
//!
//! The handshake subsystem of an RTMFP endpoint: the parser and emitter
//! for handshake packets 0x30/0x38/0x70/0x71/0x78, the dual-keyed pending
//! table (by tag and by cookie), the retransmission tick and the contract
//! exposed to the enclosing session layer.
//!
//! # Overview
//!
//! - Both sides derive a stable 32-byte peer identity by hashing the far
//!   side's public-key wire block.
//! - The responder commits no state to a requester until a 64-byte random
//!   cookie has made the round trip.
//! - Diffie-Hellman runs over the fixed 1024-bit RTMFP group; the shared
//!   secret and both fixed-template nonces feed the session-key ladder in
//!   [`crypto::derive_session_keys`].
//!
//! The engine is synchronous and single-threaded: packet ingress, the
//! tick and all session callbacks run to completion on one thread.
//! Sessions plug in through [`session::SessionHandle`]; emissions leave
//! through a [`session::PacketSink`]. The optional [`endpoint`] module
//! provides a tokio UDP pump around one engine.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use rtmfp_handshake::{EngineConfig, HandshakeEngine, OutboundQueue, SessionHandle};
//!
//! fn drive(host: Rc<RefCell<dyn SessionHandle>>, peer: std::net::SocketAddr) {
//!     let mut engine = HandshakeEngine::new(EngineConfig::default(), Rc::downgrade(&host));
//!     let mut out = OutboundQueue::new();
//!     engine.start_handshake(&host, peer, &[], true);
//!     engine.manage(&mut out);
//!     for (to, _far_id, packet) in out.drain() {
//!         // hand to the socket / session framing
//!         let _ = (to, packet);
//!     }
//! }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod session;

pub use config::EngineConfig;
pub use error::{CodecError, CryptoError, HandshakeError, RtmfpError};
pub use handshake::{HandshakeEngine, HandshakeRecord, HandshakeRole};
pub use protocol::{AddressKind, COOKIE_SIZE, TAG_SIZE};
pub use session::{OutboundQueue, PacketSink, SessionHandle, SessionStatus};
