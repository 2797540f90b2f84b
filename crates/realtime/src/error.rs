//! Error types for the socket channel.

use thiserror::Error;

/// Result type alias for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;

#[derive(Debug, Error)]
pub enum SocketError {
    /// The WebSocket handshake or TCP connect failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Read or write failure on an open connection
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server refused the namespace connection
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// A text frame could not be decoded
    #[error("Invalid frame: {0}")]
    Frame(String),
}

impl SocketError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame(message.into())
    }
}
