//! Push notification channel.
//!
//! A push message is a timestamped envelope around a typed payload:
//!
//! ```json
//! { "timestamp": 1700000000.25, "payload": { "type": "sync", "data": [...] } }
//! ```
//!
//! `timestamp` is in epoch seconds and may be fractional or absent. Sources
//! yield decoded messages; frames that do not decode are logged and skipped.

mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use crate::error::PushError;
use crate::worker::WorkerMessage;

pub use websocket::WebSocketSource;

/// Typed body of a push message; forwarded to the worker as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl From<PushPayload> for WorkerMessage {
    fn from(payload: PushPayload) -> Self {
        WorkerMessage::new(payload.kind, payload.data)
    }
}

/// One message from the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Publication time in epoch seconds.
    #[serde(default)]
    pub timestamp: Option<f64>,
    pub payload: PushPayload,
}

impl PushMessage {
    pub fn new(timestamp: Option<f64>, kind: impl Into<String>, data: Value) -> Self {
        Self { timestamp, payload: PushPayload { kind: kind.into(), data } }
    }

    /// Age relative to `now_millis`, if the message carries a timestamp.
    pub fn age_millis(&self, now_millis: i64) -> Option<i64> {
        self.timestamp.map(|seconds| now_millis - (seconds * 1000.0) as i64)
    }

    /// Decode one text frame. Returns `None` (and logs) for anything that is
    /// not a push message.
    pub fn decode(frame: &str) -> Option<Self> {
        let frame = frame.trim();
        if frame.is_empty() {
            return None;
        }
        match serde_json::from_str(frame) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(error = %err, "incompatible push message skipped");
                None
            }
        }
    }
}

/// A stream of push messages.
#[async_trait]
pub trait PushSource: Send {
    /// Next decoded message; `Ok(None)` once the source is exhausted.
    async fn next_message(&mut self) -> Result<Option<PushMessage>, PushError>;
}

/// Newline-delimited JSON over any async reader (stdin in the daemon).
pub struct LineSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self { lines: reader.lines() }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PushSource for LineSource<R> {
    async fn next_message(&mut self) -> Result<Option<PushMessage>, PushError> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(message) = PushMessage::decode(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

/// In-process source fed through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<PushMessage>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn new(capacity: usize) -> (mpsc::Sender<PushMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl PushSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<PushMessage>, PushError> {
        Ok(self.rx.recv().await)
    }
}
