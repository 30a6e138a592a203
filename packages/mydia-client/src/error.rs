//! Error types for the Mydia client.
//!
//! The split matters: [`TransportError`] is the *only* retry-eligible kind.
//! Application-level failures (non-2xx statuses, GraphQL `errors` arrays)
//! come back through the `Ok` arm or as [`ClientError::Api`] and are never
//! retried.

use thiserror::Error;

/// A failure of the transport itself — the connection, not the conversation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An error from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The request timed out awaiting its response frame.
    #[error("request timed out")]
    Timeout,

    /// The transport was never brought up.
    #[error("transport is not connected")]
    NotConnected,

    /// The tunnel closed while requests were still in flight.
    #[error("tunnel closed")]
    Closed,
}

/// Any failure the client surfaces to callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-layer failure — the one retry-eligible kind.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `execute_request` was called before any mode was established.
    #[error("connection manager is not initialized")]
    NotInitialized,

    /// The server answered with a non-2xx status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Neither relay nor any direct URL could be reached.
    #[error("no transport available: {0}")]
    Unavailable(String),

    /// The observed certificate does not match the pinned fingerprint.
    #[error("certificate fingerprint mismatch")]
    FingerprintMismatch,

    /// The server rejected a channel message with a wire reason.
    #[error("rejected by server: {reason}")]
    Rejected { reason: String },

    /// The operation was cancelled between retry attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local persistence failure.
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    /// A generic error string.
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Whether a retry can possibly help. Only transport failures qualify;
    /// everything else would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
