//! Diagnostic client: pipes standard input and output through one
//! WebSocket connection to a tunnel's ws side.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::config::MAX_CHUNK_SIZE;

/// Turns `host:port`, `:port` or a full `ws://`/`wss://` URL into a URL.
#[must_use]
pub fn websocket_url(addr: &str) -> String {
    if addr.contains("://") {
        return addr.to_string();
    }
    if addr.starts_with(':') {
        format!("ws://localhost{addr}/")
    } else {
        format!("ws://{addr}/")
    }
}

/// Runs until the server closes the WebSocket. Standard input reaching EOF
/// does not end the session.
pub async fn run_test_client(addr: &str) -> Result<()> {
    let url = websocket_url(addr);
    info!(url = %url, "Connecting");
    let (websocket, _) = connect_async(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    pipe_session(websocket, tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("Connection closed");
    Ok(())
}

/// Sends `input` as binary messages and copies received messages to
/// `output` until the peer closes. An input failure ends the session.
async fn pipe_session<S, R, W>(
    websocket: WebSocketStream<S>,
    mut input: R,
    mut output: W,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (mut sender, mut receiver) = websocket.split();

    let mut input_to_ws = tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            let n = input
                .read(&mut buffer)
                .await
                .context("Failed to read standard input")?;
            if n == 0 {
                debug!("Standard input closed");
                return anyhow::Ok(());
            }
            sender
                .send(Message::Binary(buffer[..n].to_vec().into()))
                .await
                .context("Failed to send standard input via WebSocket")?;
        }
    });

    let ws_to_output = async {
        while let Some(message) = receiver.next().await {
            match message.context("WebSocket error")? {
                Message::Binary(data) => output.write_all(&data).await?,
                Message::Text(text) => output.write_all(text.as_bytes()).await?,
                Message::Close(_) => break,
                _ => continue,
            }
            output.flush().await?;
        }
        anyhow::Ok(())
    };
    tokio::pin!(ws_to_output);

    tokio::select! {
        result = &mut ws_to_output => {
            input_to_ws.abort();
            result
        }
        joined = &mut input_to_ws => {
            joined.context("Standard input task failed")??;
            ws_to_output.await
        }
    }
}
