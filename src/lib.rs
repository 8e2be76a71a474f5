//! WebSocket/TCP Tunnel
//!
//! Bridges TCP clients and WebSocket clients through persistent relays. Each
//! configured pair has a WebSocket listener and a TCP listener feeding one
//! relay, which keeps relaying across reconnects of either side.

pub mod admission;
pub mod buffer;
pub mod client;
pub mod config;
pub mod half_link;
pub mod listener;
pub mod relay;
pub mod server;
pub mod tls;
pub mod transport;

// Re-export commonly used types and functions
pub use admission::{AdmissionController, IpAllowList, Rejection, SessionPermit};
pub use client::run_test_client;
pub use config::{
    Config, ConfigError, MAX_CHUNK_SIZE, PairConfig, RelayConfig, TlsConfig, load_config,
    parse_endpoint, parse_pair,
};
pub use half_link::{DetachReason, Detached, HalfLink, LinkState, RelayError, Side};
pub use relay::Relay;
pub use server::{Pair, run_server};
pub use transport::{ChunkReader, ChunkWriter, Connection};
