use tokio::sync::mpsc;

use crate::buffer;
use crate::config::{MAX_CHUNK_SIZE, RelayConfig};
use crate::half_link::{self, HalfLink, OwnEnds, PeerEnds, Side};

/// A tcp Half-Link and a ws Half-Link wired so that each one's filled
/// buffers are flushed by the other and come back to its own pool.
#[derive(Debug, Clone)]
pub struct Relay {
    tcp: HalfLink,
    ws: HalfLink,
}

impl Relay {
    /// Wires both sides and spawns their four loops onto the current tokio
    /// runtime. The loops run until every handle to the relay is dropped.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let stall_timeout = config.stall_timeout();

        let (tcp_pool_tx, tcp_pool_rx) = buffer::pool(pool_size, chunk_size);
        let (ws_pool_tx, ws_pool_rx) = buffer::pool(pool_size, chunk_size);
        // A side's flush queue carries buffers filled by the opposite side.
        let (tcp_flush_tx, tcp_flush_rx) = mpsc::channel(pool_size);
        let (ws_flush_tx, ws_flush_rx) = mpsc::channel(pool_size);
        let (tcp_state_tx, tcp_state_rx) = half_link::state_channel();
        let (ws_state_tx, ws_state_rx) = half_link::state_channel();

        let (tcp, tcp_read, tcp_write) = half_link::build(
            Side::Tcp,
            OwnEnds {
                pool_tx: tcp_pool_tx.clone(),
                pool_rx: tcp_pool_rx,
                flush_rx: tcp_flush_rx,
            },
            tcp_state_tx,
            PeerEnds {
                flush_tx: ws_flush_tx,
                pool_tx: ws_pool_tx.clone(),
                state: ws_state_rx,
            },
            stall_timeout,
        );
        let (ws, ws_read, ws_write) = half_link::build(
            Side::Ws,
            OwnEnds {
                pool_tx: ws_pool_tx,
                pool_rx: ws_pool_rx,
                flush_rx: ws_flush_rx,
            },
            ws_state_tx,
            PeerEnds {
                flush_tx: tcp_flush_tx,
                pool_tx: tcp_pool_tx,
                state: tcp_state_rx,
            },
            stall_timeout,
        );

        tokio::spawn(tcp_write.run());
        tokio::spawn(ws_write.run());
        tokio::spawn(tcp_read.run());
        tokio::spawn(ws_read.run());

        Self { tcp, ws }
    }

    #[must_use]
    pub const fn tcp(&self) -> &HalfLink {
        &self.tcp
    }

    #[must_use]
    pub const fn ws(&self) -> &HalfLink {
        &self.ws
    }

    #[must_use]
    pub const fn side(&self, side: Side) -> &HalfLink {
        match side {
            Side::Tcp => &self.tcp,
            Side::Ws => &self.ws,
        }
    }
}
