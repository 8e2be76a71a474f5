//! One side of a relay.
//!
//! A Half-Link outlives the connections attached to it. Its read loop owns
//! the attached connection's reader and a pool of idle buffers; its write
//! loop owns the attached connection's writer and drains buffers filled by
//! the opposite side. Buffers travel between the two sides by value, so the
//! only coordination is the channels themselves plus the published
//! [`LinkState`].

use std::{fmt, io, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::transport::{ChunkReader, ChunkWriter, Connection};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Tcp,
    Ws,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Ws => f.write_str("ws"),
        }
    }
}

/// Attachment state of a Half-Link. Each attached connection gets a new,
/// strictly increasing writer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle { next: u64 },
    Attached { generation: u64 },
}

impl LinkState {
    const INITIAL: Self = Self::Idle { next: 1 };

    /// The oldest writer generation allowed to receive a chunk produced now.
    #[must_use]
    pub const fn eligible_generation(self) -> u64 {
        match self {
            Self::Idle { next } => next,
            Self::Attached { generation } => generation,
        }
    }

    #[must_use]
    pub const fn is_attached(self) -> bool {
        matches!(self, Self::Attached { .. })
    }
}

#[derive(Debug)]
pub enum DetachReason {
    Eof,
    ReadError(io::Error),
    WriteError,
    /// No buffer came back within the configured stall timeout.
    Stalled,
    Shutdown,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("peer closed"),
            Self::ReadError(e) => write!(f, "read failed: {e}"),
            Self::WriteError => f.write_str("write failed"),
            Self::Stalled => f.write_str("counterpart stalled"),
            Self::Shutdown => f.write_str("relay shut down"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0} half-link is no longer running")]
    Closed(Side),
}

struct Attachment {
    connection: Connection,
    ended: oneshot::Sender<DetachReason>,
}

enum WriterEvent {
    Attached {
        generation: u64,
        writer: Box<dyn ChunkWriter>,
        failed: oneshot::Sender<()>,
    },
    Detached {
        generation: u64,
    },
}

/// Resolves once the attached connection has been retired.
#[derive(Debug)]
pub struct Detached {
    rx: oneshot::Receiver<DetachReason>,
}

impl Detached {
    pub async fn wait(self) -> DetachReason {
        self.rx.await.unwrap_or(DetachReason::Shutdown)
    }
}

/// Cloneable handle to a running Half-Link.
#[derive(Debug, Clone)]
pub struct HalfLink {
    side: Side,
    attach_tx: mpsc::Sender<Attachment>,
    state: watch::Receiver<LinkState>,
}

impl HalfLink {
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Hands `connection` to the read loop. The caller must not attach
    /// again until the returned [`Detached`] resolves.
    pub async fn attach(&self, connection: Connection) -> Result<Detached, RelayError> {
        let (ended, rx) = oneshot::channel();
        self.attach_tx
            .send(Attachment { connection, ended })
            .await
            .map_err(|_| RelayError::Closed(self.side))?;
        Ok(Detached { rx })
    }
}

/// Channel ends a Half-Link needs from its opposite side.
pub(crate) struct PeerEnds {
    /// Where filled buffers go to be written out on the opposite side.
    pub flush_tx: mpsc::Sender<Buffer>,
    /// Where drained buffers go back to, the opposite side's pool.
    pub pool_tx: mpsc::Sender<Buffer>,
    pub state: watch::Receiver<LinkState>,
}

/// Channel ends a Half-Link owns itself.
pub(crate) struct OwnEnds {
    pub pool_tx: mpsc::Sender<Buffer>,
    pub pool_rx: mpsc::Receiver<Buffer>,
    pub flush_rx: mpsc::Receiver<Buffer>,
}

/// Builds the handle and both loops of one side. The loops are returned
/// unspawned so the caller can cross-wire before starting them.
pub(crate) fn build(
    side: Side,
    own: OwnEnds,
    state_tx: watch::Sender<LinkState>,
    peer: PeerEnds,
    stall_timeout: Option<Duration>,
) -> (HalfLink, ReadLoop, WriteLoop) {
    let (attach_tx, attach_rx) = mpsc::channel(1);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = HalfLink {
        side,
        attach_tx,
        state: state_tx.subscribe(),
    };
    let write_loop = WriteLoop {
        side,
        events_rx,
        flush_rx: own.flush_rx,
        peer_pool_tx: peer.pool_tx,
        state: state_tx.subscribe(),
    };
    let read_loop = ReadLoop {
        side,
        attach_rx,
        pool_rx: own.pool_rx,
        pool_tx: own.pool_tx,
        state_tx,
        events_tx,
        peer_state: peer.state,
        peer_flush_tx: peer.flush_tx,
        stall_timeout,
    };
    (handle, read_loop, write_loop)
}

/// Fresh state publication for one side, starting idle.
pub(crate) fn state_channel() -> (watch::Sender<LinkState>, watch::Receiver<LinkState>) {
    watch::channel(LinkState::INITIAL)
}

pub(crate) struct ReadLoop {
    side: Side,
    attach_rx: mpsc::Receiver<Attachment>,
    pool_rx: mpsc::Receiver<Buffer>,
    pool_tx: mpsc::Sender<Buffer>,
    state_tx: watch::Sender<LinkState>,
    events_tx: mpsc::UnboundedSender<WriterEvent>,
    peer_state: watch::Receiver<LinkState>,
    peer_flush_tx: mpsc::Sender<Buffer>,
    stall_timeout: Option<Duration>,
}

impl ReadLoop {
    pub(crate) async fn run(mut self) {
        let side = self.side;
        let mut generation = 0;

        while let Some(Attachment { connection, ended }) = self.attach_rx.recv().await {
            generation += 1;
            let peer = connection.peer();
            let (reader, writer) = connection.into_parts();
            let (failed, failed_rx) = oneshot::channel();

            self.state_tx
                .send_replace(LinkState::Attached { generation });
            if self
                .events_tx
                .send(WriterEvent::Attached {
                    generation,
                    writer,
                    failed,
                })
                .is_err()
            {
                let _ = ended.send(DetachReason::Shutdown);
                break;
            }
            info!(%side, generation, peer = ?peer, "Connection attached");

            let reason = self.pump(reader, failed_rx).await;

            let _ = self.events_tx.send(WriterEvent::Detached { generation });
            self.state_tx.send_replace(LinkState::Idle {
                next: generation + 1,
            });
            info!(%side, generation, reason = %reason, "Connection detached");
            let _ = ended.send(reason);
        }

        debug!(%side, "Read loop stopped");
    }

    /// Relays from one connection until it fails.
    async fn pump(
        &mut self,
        mut reader: Box<dyn ChunkReader>,
        mut failed: oneshot::Receiver<()>,
    ) -> DetachReason {
        loop {
            let mut buffer = tokio::select! {
                buffer = self.acquire() => match buffer {
                    Ok(buffer) => buffer,
                    Err(reason) => return reason,
                },
                result = &mut failed => return write_failure(result),
            };

            let result = tokio::select! {
                result = reader.read_chunk(buffer.space()) => result,
                failure = &mut failed => {
                    self.recycle(buffer);
                    return write_failure(failure);
                }
            };

            match result {
                Ok(0) => {
                    self.recycle(buffer);
                    return DetachReason::Eof;
                }
                Ok(n) => {
                    let generation = self.peer_state.borrow().eligible_generation();
                    buffer.fill(n, generation);
                    debug!(side = %self.side, bytes = n, generation, "Forwarding chunk");
                    if self.peer_flush_tx.send(buffer).await.is_err() {
                        return DetachReason::Shutdown;
                    }
                }
                Err(e) => {
                    self.recycle(buffer);
                    return DetachReason::ReadError(e);
                }
            }
        }
    }

    /// Takes an idle buffer, waiting while every buffer is in flight.
    async fn acquire(&mut self) -> Result<Buffer, DetachReason> {
        let buffer = match self.stall_timeout {
            Some(limit) => timeout(limit, self.pool_rx.recv())
                .await
                .map_err(|_| DetachReason::Stalled)?,
            None => self.pool_rx.recv().await,
        };
        buffer.ok_or(DetachReason::Shutdown)
    }

    fn recycle(&self, buffer: Buffer) {
        // The pool channel is sized to hold every buffer, so this only fails
        // once the relay is shutting down.
        let _ = self.pool_tx.try_send(buffer);
    }
}

fn write_failure(signal: Result<(), oneshot::error::RecvError>) -> DetachReason {
    match signal {
        Ok(()) => DetachReason::WriteError,
        Err(_) => DetachReason::Shutdown,
    }
}

struct ActiveWriter {
    generation: u64,
    writer: Box<dyn ChunkWriter>,
    failed: oneshot::Sender<()>,
}

impl ActiveWriter {
    async fn close(mut self, side: Side) {
        match timeout(CLOSE_TIMEOUT, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(%side, generation = self.generation, error = %e, "Close failed"),
            Err(_) => debug!(%side, generation = self.generation, "Close timed out"),
        }
    }
}

pub(crate) struct WriteLoop {
    side: Side,
    events_rx: mpsc::UnboundedReceiver<WriterEvent>,
    flush_rx: mpsc::Receiver<Buffer>,
    peer_pool_tx: mpsc::Sender<Buffer>,
    state: watch::Receiver<LinkState>,
}

impl WriteLoop {
    pub(crate) async fn run(mut self) {
        let side = self.side;
        let mut current: Option<ActiveWriter> = None;

        loop {
            let buffer = tokio::select! {
                biased;
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        apply(side, event, &mut current).await;
                        continue;
                    }
                    None => break,
                },
                buffer = self.flush_rx.recv() => match buffer {
                    Some(buffer) => buffer,
                    None => break,
                },
            };

            let delivered = loop {
                // A detach already queued must retire its writer before this
                // buffer picks one, so the chunk waits for the replacement.
                while let Ok(event) = self.events_rx.try_recv() {
                    apply(side, event, &mut current).await;
                }
                if let Some(active) = current.as_mut() {
                    if active.generation >= buffer.generation() {
                        let generation = active.generation;
                        break tokio::select! {
                            result = active.writer.write_chunk(buffer.filled()) => result,
                            () = detached(&mut self.state, generation) => {
                                Err(io::Error::new(io::ErrorKind::NotConnected, "connection detached"))
                            }
                        };
                    }
                }
                match self.events_rx.recv().await {
                    Some(event) => apply(side, event, &mut current).await,
                    None => return,
                }
            };

            match delivered {
                Ok(()) => {
                    debug!(%side, bytes = buffer.filled().len(), "Chunk delivered");
                }
                Err(e) => {
                    warn!(%side, error = %e, bytes = buffer.filled().len(), "Failed to write chunk");
                    if let Some(active) = current.take() {
                        let _ = active.failed.send(());
                    }
                }
            }
            // The opposite pool holds every buffer it owns, so this only
            // fails once that side has stopped.
            let _ = self.peer_pool_tx.try_send(buffer);
        }

        debug!(%side, "Write loop stopped");
    }
}

/// Resolves once `generation` is no longer the attached connection.
async fn detached(state: &mut watch::Receiver<LinkState>, generation: u64) {
    let _ = state
        .wait_for(|s| *s != LinkState::Attached { generation })
        .await;
}

async fn apply(side: Side, event: WriterEvent, current: &mut Option<ActiveWriter>) {
    match event {
        WriterEvent::Attached {
            generation,
            writer,
            failed,
        } => {
            let fresh = ActiveWriter {
                generation,
                writer,
                failed,
            };
            if let Some(stale) = current.replace(fresh) {
                stale.close(side).await;
            }
        }
        WriterEvent::Detached { generation } => {
            if current.as_ref().is_some_and(|w| w.generation == generation) {
                if let Some(active) = current.take() {
                    active.close(side).await;
                }
            }
        }
    }
}
