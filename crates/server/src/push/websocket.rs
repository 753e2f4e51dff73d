//! WebSocket push source.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

use super::{PushMessage, PushSource};
use crate::error::PushError;

/// Push messages carried as JSON text frames over a WebSocket.
///
/// Pings are answered, binary frames are decoded as UTF-8 text, and a close
/// frame ends the source.
pub struct WebSocketSource {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketSource {
    /// Connect to `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<Self, PushError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| PushError::Connect(format!("{url}: {e}")))?;
        tracing::info!(url, status = response.status().as_u16(), "push channel connected");
        Ok(Self { url: url.to_string(), stream })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushSource for WebSocketSource {
    async fn next_message(&mut self) -> Result<Option<PushMessage>, PushError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                tungstenite::Message::Text(text) => {
                    if let Some(message) = PushMessage::decode(&text) {
                        return Ok(Some(message));
                    }
                }
                tungstenite::Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if let Some(message) = PushMessage::decode(text) {
                            return Ok(Some(message));
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "binary push frame is not UTF-8"),
                },
                tungstenite::Message::Ping(data) => {
                    self.stream.send(tungstenite::Message::Pong(data)).await?;
                }
                tungstenite::Message::Close(frame) => {
                    tracing::info!(url = %self.url, reason = ?frame, "push channel closed by peer");
                    return Ok(None);
                }
                tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => {}
            }
        }
        tracing::info!(url = %self.url, "push channel interrupted");
        Ok(None)
    }
}
