//! UDP pump for a handshake engine
//!
//! Binds one socket, feeds inbound datagrams to the engine and drives the
//! retransmission tick. The engine itself is synchronous and `!Send`
//! (sessions are `Rc`-shared), so the pump is meant for a current-thread
//! runtime or a `LocalSet` task.
//!
//! This is a development pump: it moves handshake envelopes as-is. A full
//! session layer wraps emissions in its encrypted packet framing, which is
//! where the `far_id` of each queued packet is consumed.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Weak;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::handshake::HandshakeEngine;
use crate::protocol::envelope::MAX_PACKET_SIZE;
use crate::session::{OutboundQueue, SessionHandle};

/// Cadence of the retransmission tick.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

pub struct Endpoint {
    socket: UdpSocket,
    engine: HandshakeEngine,
    queue: OutboundQueue,
}

impl Endpoint {
    /// Bind a UDP socket and wrap a fresh engine around `host`.
    pub async fn bind(
        address: SocketAddr,
        config: EngineConfig,
        host: Weak<RefCell<dyn SessionHandle>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        info!("Endpoint listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            engine: HandshakeEngine::new(config, host),
            queue: OutboundQueue::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine_mut(&mut self) -> &mut HandshakeEngine {
        &mut self.engine
    }

    /// Run the pump until cancelled: inbound datagrams and the tick both
    /// flush any queued emissions before the next suspension point.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tick = interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    self.engine.process(from, &buf[..len], &mut self.queue);
                    self.flush().await;
                }
                _ = tick.tick() => {
                    self.engine.manage(&mut self.queue);
                    self.flush().await;
                }
            }
        }
    }

    async fn flush(&mut self) {
        for (to, _far_id, packet) in self.queue.drain() {
            if let Err(err) = self.socket.send_to(&packet, to).await {
                warn!("Send to {to} failed: {err}");
            }
        }
    }
}
