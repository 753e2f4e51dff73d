//! Structured errors for the push channel.

/// Failures of a [`PushSource`](crate::push::PushSource).
///
/// Undecodable frames are not errors: sources log and skip them.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The endpoint could not be reached.
    #[error("PUSH_CONNECT: {0}")]
    Connect(String),

    /// The underlying stream failed mid-way.
    #[error("PUSH_STREAM: {0}")]
    Stream(String),

    /// Reading from a line-oriented source failed.
    #[error("PUSH_IO: {0}")]
    Io(#[from] std::io::Error),

    /// An accepted message could not be handed on.
    #[error("PUSH_DISPATCH: {0}")]
    Dispatch(#[from] synccache_core::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for PushError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PushError::Stream(err.to_string())
    }
}
