use anyhow::{Result, bail};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::config::{Config, PairConfig, RelayConfig};
use crate::listener::{SideListener, Transport};
use crate::relay::Relay;
use crate::tls::load_tls_acceptor;

/// A running tunnel pair: both listeners bound and spawned, relay wired.
#[derive(Debug)]
pub struct Pair {
    pub ws_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub relay: Relay,
    pub admission: Arc<AdmissionController>,
}

impl Pair {
    /// Binds both listeners and spawns them. A bind failure aborts this
    /// pair only.
    pub async fn start(index: usize, pair: &PairConfig, relay_config: &RelayConfig) -> Result<Self> {
        let admission = Arc::new(AdmissionController::from_pair(pair)?);
        let tls = pair.tls.as_ref().map(load_tls_acceptor).transpose()?;
        let relay = Relay::new(relay_config);

        let ws_listener = SideListener::bind(
            &pair.ws_bind_addr()?,
            Transport::WebSocket { tls },
            relay.ws().clone(),
            Arc::clone(&admission),
            relay_config,
        )
        .await?;
        let tcp_listener = SideListener::bind(
            &pair.tcp_bind_addr()?,
            Transport::Tcp,
            relay.tcp().clone(),
            Arc::clone(&admission),
            relay_config,
        )
        .await?;

        let ws_addr = ws_listener.local_addr()?;
        let tcp_addr = tcp_listener.local_addr()?;
        info!(
            pair = index,
            ws_addr = %ws_addr,
            tcp_addr = %tcp_addr,
            tls = pair.tls.is_some(),
            max_sessions = ?pair.max_sessions,
            "Tunnel pair started"
        );

        for listener in [ws_listener, tcp_listener] {
            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    error!(pair = index, error = ?e, "Listener stopped");
                }
            });
        }

        Ok(Self {
            ws_addr,
            tcp_addr,
            relay,
            admission,
        })
    }
}

/// Starts every configured pair and blocks until interrupted.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    info!(
        pairs = config.pairs.len(),
        pool_size = config.relay.pool_size,
        stall_timeout = ?config.relay.stall_timeout(),
        "Configuration loaded"
    );

    let mut running = Vec::with_capacity(config.pairs.len());
    for (index, pair) in config.pairs.iter().enumerate() {
        match Pair::start(index, pair, &config.relay).await {
            Ok(started) => running.push(started),
            Err(e) => error!(pair = index, ws = %pair.ws, tcp = %pair.tcp, error = ?e, "Pair failed to start"),
        }
    }
    if running.is_empty() {
        bail!("No tunnel pair could be started");
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}
