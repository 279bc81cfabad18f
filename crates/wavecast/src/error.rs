//! Error types for the broker, one enum per concern.

use thiserror::Error;

/// Failures while packing, unpacking or (de)serializing wire frames.
///
/// Decode failures are never fatal for a connection: the offending message
/// is dropped and the connection keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no separator between event name and payload")]
    MissingSeparator,

    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload decode failed: {0}")]
    Decode(String),

    #[error("payload encode failed: {0}")]
    Encode(String),
}

/// Why a non-blocking enqueue onto a connection's outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {field}: expected {expected}")]
    InvalidValue {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("validation failed for {field}: {reason}")]
    ValidationFailed { field: &'static str, reason: String },
}

/// Transport-level failures: socket I/O, handshake and server setup.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<tokio_tungstenite::tungstenite::Error> for SocketError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match error {
            Error::Io(io) => Self::Io(io),
            Error::Http(response) => Self::Handshake(format!(
                "upgrade rejected with status {}",
                response.status()
            )),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Result alias for transport-level operations.
pub type SocketResult<T> = Result<T, SocketError>;
