//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base delay between handshake 30 retransmissions; the effective delay
/// grows with the attempt counter (attempt x base).
pub const RETRY_INTERVAL: Duration = Duration::from_millis(1500);

/// Attempt counter value at which a pending handshake is abandoned.
pub const MAX_ATTEMPTS: u8 = 12;

/// Tunable knobs of the handshake engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base retransmission delay; attempt `n` waits `n * retry_interval`.
    pub retry_interval: Duration,
    /// Removal threshold for the attempt counter. Sends happen at counter
    /// values `1..max_attempts`; reaching `max_attempts` removes the record
    /// and fails the session instead of sending.
    pub max_attempts: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_interval: RETRY_INTERVAL,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}
