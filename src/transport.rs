//! The byte-stream view of a tunnel connection.
//!
//! The relay only needs "read a chunk", "write a chunk" and "close". Both
//! TCP sockets and WebSocket sessions are reduced to that pair of halves so
//! the Half-Link never sees which transport it is driving.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{fmt, io, net::SocketAddr};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as TungsteniteError, Message, error::ProtocolError},
};
use tracing::{debug, warn};

#[async_trait]
pub trait ChunkReader: Send {
    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer closed.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
pub trait ChunkWriter: Send {
    /// Writes the whole chunk, as one message where the transport frames.
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl ChunkReader for OwnedReadHalf {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl ChunkWriter for OwnedWriteHalf {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl<T: AsyncRead + Send> ChunkReader for ReadHalf<T> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl<T: AsyncWrite + Send> ChunkWriter for WriteHalf<T> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Reads binary message payloads as a byte stream. A message larger than
/// the caller's buffer is handed out over several reads.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Vec<u8>,
    offset: usize,
}

#[async_trait]
impl<S> ChunkReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.offset);
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }

            match self.stream.next().await {
                None => return Ok(0),
                Some(Ok(Message::Binary(data))) => {
                    self.pending = data.to_vec();
                    self.offset = 0;
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("Dropping text message (binary only)");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("WebSocket connection closed");
                    return Ok(0);
                }
                Some(Ok(_)) => {}
                Some(Err(
                    e @ (TungsteniteError::ConnectionClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
                )) => {
                    debug!("Client disconnected: {e}");
                    return Ok(0);
                }
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> ChunkWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.sink
            .send(Message::Binary(chunk.to_vec().into()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await.map_err(io::Error::other)
    }
}

/// An ordered, reliable byte stream ready to be attached to a Half-Link.
pub struct Connection {
    reader: Box<dyn ChunkReader>,
    writer: Box<dyn ChunkWriter>,
    peer: Option<SocketAddr>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(reader: Box<dyn ChunkReader>, writer: Box<dyn ChunkWriter>) -> Self {
        Self {
            reader,
            writer,
            peer: None,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            ..Self::new(Box::new(reader), Box::new(writer))
        }
    }

    /// Wraps any in-process duplex stream.
    pub fn from_stream<T>(stream: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer))
    }

    pub fn from_websocket<S>(websocket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = websocket.split();
        Self::new(
            Box::new(WsReader {
                stream,
                pending: Vec::new(),
                offset: 0,
            }),
            Box::new(WsWriter { sink }),
        )
    }

    #[must_use]
    pub const fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn into_parts(self) -> (Box<dyn ChunkReader>, Box<dyn ChunkWriter>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    /// Builds a server/client WebSocket pair over an in-memory pipe.
    async fn websocket_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    mod streams {
        use super::*;

        #[tokio::test]
        async fn reads_until_eof() {
            let mock = tokio_test::io::Builder::new()
                .read(b"PING")
                .read(b"PONG")
                .build();
            let (mut reader, _writer) = Connection::from_stream(mock).into_parts();

            let mut buf = [0u8; 16];
            assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 4);
            assert_eq!(&buf[..4], b"PING");
            assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 4);
            assert_eq!(&buf[..4], b"PONG");
            assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn writes_whole_chunk() {
            let mock = tokio_test::io::Builder::new().write(b"hello").build();
            let (_reader, mut writer) = Connection::from_stream(mock).into_parts();
            writer.write_chunk(b"hello").await.unwrap();
            writer.close().await.unwrap();
        }

        #[tokio::test]
        async fn tcp_connection_records_peer() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, remote) = listener.accept().await.unwrap();

            let connection = Connection::from_tcp(server);
            assert_eq!(connection.peer(), Some(remote));
            drop(client);
        }
    }

    mod websocket {
        use super::*;

        #[tokio::test]
        async fn each_chunk_is_one_binary_message() {
            let (server, mut client) = websocket_pair().await;
            let (_reader, mut writer) = Connection::from_websocket(server).into_parts();

            let chunk = vec![0x5A; 65535];
            writer.write_chunk(&chunk).await.unwrap();

            let message = timeout(TEST_TIMEOUT, client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match message {
                Message::Binary(data) => assert_eq!(data.to_vec(), chunk),
                other => panic!("expected binary message, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn large_message_spans_several_reads() {
            let (server, mut client) = websocket_pair().await;
            let (mut reader, _writer) = Connection::from_websocket(server).into_parts();

            client
                .send(Message::Binary(b"abcdefgh".to_vec().into()))
                .await
                .unwrap();

            let mut buf = [0u8; 5];
            assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 5);
            assert_eq!(&buf, b"abcde");
            assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 3);
            assert_eq!(&buf[..3], b"fgh");
        }

        #[tokio::test]
        async fn text_messages_are_skipped() {
            let (server, mut client) = websocket_pair().await;
            let (mut reader, _writer) = Connection::from_websocket(server).into_parts();

            client
                .send(Message::Text("ignored".to_string().into()))
                .await
                .unwrap();
            client
                .send(Message::Binary(b"kept".to_vec().into()))
                .await
                .unwrap();

            let mut buf = [0u8; 16];
            let n = timeout(TEST_TIMEOUT, reader.read_chunk(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"kept");
        }

        #[tokio::test]
        async fn close_frame_reads_as_eof() {
            let (server, mut client) = websocket_pair().await;
            let (mut reader, _writer) = Connection::from_websocket(server).into_parts();

            client.close(None).await.unwrap();

            let mut buf = [0u8; 16];
            let n = timeout(TEST_TIMEOUT, reader.read_chunk(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }
}
