//! Client error types.

use thiserror::Error;

/// Errors that can occur in the attach client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server URL could not be turned into a WebSocket URL.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The session ID is not usable in a URL path.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Failed to encode an outbound message.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
