//! The handshake subsystem
//!
//! - [`engine`]: packet dispatch, emissions and the retransmission tick
//! - [`record`]: per-handshake pending state
//! - [`table`]: the dual-keyed (tag / cookie) pending table

pub mod engine;
pub mod record;
pub mod table;

pub use engine::HandshakeEngine;
pub use record::{HandshakeRecord, HandshakeRole};
pub use table::{PendingTable, SharedRecord};
