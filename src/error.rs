//! Error types for the voice pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Connection could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Connection handshake did not complete in time
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// Operation needs an open connection
    #[error("not connected")]
    NotConnected,

    /// Connection dropped while work was pending
    #[error("connection closed")]
    Disconnected,

    /// Control connection could not be restored
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Malformed or unexpected message from a backend
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Synthesis backend reported an error for a request
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Control server reported an error
    #[error("server error: {0}")]
    Server(String),

    /// Audio payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Repeated empty transcripts, microphone is probably dead
    #[error("no speech detected in {count} consecutive turns, check the microphone")]
    NoSpeechInput {
        /// Consecutive empty transcripts seen
        count: u32,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error came from a lost or unreachable connection
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionTimeout(_)
                | Self::NotConnected
                | Self::Disconnected
                | Self::ReconnectExhausted { .. }
                | Self::WebSocket(_)
        )
    }
}
