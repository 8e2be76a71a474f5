//! Accept loops feeding a Half-Link.
//!
//! A listener serves one side of one pair and handles a single connection
//! at a time: it does not accept again until the Half-Link reports the
//! attached connection has ended, so the Half-Link's slot never holds two.

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::config::RelayConfig;
use crate::half_link::{HalfLink, Side};
use crate::transport::Connection;

pub enum Transport {
    Tcp,
    WebSocket { tls: Option<TlsAcceptor> },
}

impl Transport {
    const fn side(&self) -> Side {
        match self {
            Self::Tcp => Side::Tcp,
            Self::WebSocket { .. } => Side::Ws,
        }
    }
}

pub struct SideListener {
    listener: TcpListener,
    transport: Transport,
    link: HalfLink,
    admission: Arc<AdmissionController>,
    reject_cooldown: Duration,
    handshake_timeout: Duration,
}

impl SideListener {
    pub async fn bind(
        addr: &str,
        transport: Transport,
        link: HalfLink,
        admission: Arc<AdmissionController>,
        timing: &RelayConfig,
    ) -> Result<Self> {
        let side = transport.side();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {side} listener to address {addr}"))?;
        Ok(Self {
            listener,
            transport,
            link,
            admission,
            reject_cooldown: timing.reject_cooldown(),
            handshake_timeout: timing.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get listener local address")
    }

    /// Accepts connections until accepting itself fails.
    pub async fn run(self) -> Result<()> {
        let side = self.transport.side();
        info!(%side, listen_addr = %self.local_addr()?, "Listening");

        loop {
            let (stream, client_addr) = self
                .listener
                .accept()
                .await
                .with_context(|| format!("Failed to accept {side} connection"))?;
            self.serve(stream, client_addr).await;
        }
    }

    #[tracing::instrument(skip(self, stream), fields(side = %self.transport.side()))]
    async fn serve(&self, stream: TcpStream, client_addr: SocketAddr) {
        info!("Connected");

        let permit = match self.admission.try_admit(client_addr) {
            Ok(permit) => permit,
            Err(rejection) => {
                warn!(reason = %rejection, "Rejecting connection");
                drop(stream);
                sleep(self.reject_cooldown).await;
                return;
            }
        };

        let connection = match self.establish(stream).await {
            Ok(connection) => connection.with_peer(client_addr),
            Err(e) => {
                warn!(error = ?e, "Handshake failed");
                return;
            }
        };

        let detached = match self.link.attach(connection).await {
            Ok(detached) => detached,
            Err(e) => {
                error!(error = %e, "Failed to attach connection");
                return;
            }
        };

        let reason = detached.wait().await;
        info!(reason = %reason, "Session ended");
        drop(permit);
    }

    async fn establish(&self, stream: TcpStream) -> Result<Connection> {
        match &self.transport {
            Transport::Tcp => Ok(Connection::from_tcp(stream)),
            Transport::WebSocket { tls } => {
                timeout(self.handshake_timeout, upgrade(stream, tls.as_ref()))
                    .await
                    .context("Handshake timed out")?
            }
        }
    }
}

async fn upgrade(stream: TcpStream, tls: Option<&TlsAcceptor>) -> Result<Connection> {
    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .context("Failed to perform TLS handshake")?;
            let websocket = accept_async(tls_stream)
                .await
                .context("Failed to perform WebSocket handshake")?;
            Ok(Connection::from_websocket(websocket))
        }
        None => {
            let websocket = accept_async(stream)
                .await
                .context("Failed to perform WebSocket handshake")?;
            Ok(Connection::from_websocket(websocket))
        }
    }
}
