//! Unified error types for synccache.
//!
//! Every variant renders with a stable upper-case code prefix so that log
//! lines and relayed worker messages can be matched without parsing.

use tokio_rusqlite::rusqlite;

/// Unified error types for the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., an empty URL).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// URL could not be parsed or canonicalized.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Stored headers or payloads could not be (de)serialized.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(String),

    /// The server answered with an error status (400-599).
    #[error("HTTP_ERROR: {status} {status_text}")]
    Http { status: u16, status_text: String },

    /// The request never produced a response.
    #[error("TRANSPORT_ERROR: {0}")]
    Transport(String),

    /// A response body could not be decoded into the requested type.
    #[error("DECODE_ERROR: {0}")]
    Decode(String),

    /// The sync worker is gone and can no longer accept messages.
    #[error("WORKER_UNAVAILABLE")]
    WorkerUnavailable,
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error is a `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Http { status: 404, status_text: "Not Found".to_string() };
        assert_eq!(err.to_string(), "HTTP_ERROR: 404 Not Found");
    }

    #[test]
    fn test_error_status() {
        let err = Error::Http { status: 404, status_text: "Not Found".to_string() };
        assert_eq!(err.status(), Some(404));
        assert!(err.is_not_found());

        let err = Error::Transport("connection refused".to_string());
        assert_eq!(err.status(), None);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_from_serde_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse.into();
        assert!(err.to_string().starts_with("SERIALIZATION_ERROR"));
    }
}
