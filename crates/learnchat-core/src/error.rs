//! Error types for LearnChat Core

use thiserror::Error;

/// Main error type for LearnChat client operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Remote(String),

    #[error("Another exchange is already in flight")]
    ExchangeInFlight,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistent connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Connection lost: {0}")]
    LinkLost(String),

    #[error("Reconnection attempts exhausted ({0})")]
    ReconnectExhausted(u32),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },

    #[error("Chunk stream regressed from {previous} to {current} characters")]
    ChunkRegression { previous: usize, current: usize },

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),
}

impl Error {
    /// Whether this error came from the persistent connection rather than
    /// from the backend or the payloads it sent.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(ConnectionError::ConnectFailed(err.to_string()))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {}", err))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
