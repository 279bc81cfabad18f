//! Core frame and identity types shared across the broker.
//!
//! `SocketMessage` is the crate-native frame enum; the tungstenite message
//! type only appears at the transport edge via the conversions below.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which frame kind a protocol reads and writes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// A single WebSocket frame as seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Ping frame
    Ping(Vec<u8>),
    /// Pong frame
    Pong(Vec<u8>),
    /// Close frame with an optional reason
    Close(Option<CloseReason>),
}

/// Close code and human-readable reason carried by a close frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl SocketMessage {
    pub fn text<T: Into<String>>(content: T) -> Self {
        Self::Text(content.into())
    }

    pub fn binary<T: Into<Vec<u8>>>(data: T) -> Self {
        Self::Binary(data.into())
    }

    pub fn ping() -> Self {
        Self::Ping(Vec::new())
    }

    pub fn close() -> Self {
        Self::Close(None)
    }

    pub fn close_with_reason(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseReason {
            code,
            reason: reason.into(),
        }))
    }

    /// Payload length in bytes, zero for control frames without data.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close(_))
    }
}

impl From<tungstenite::Message> for SocketMessage {
    fn from(message: tungstenite::Message) -> Self {
        match message {
            tungstenite::Message::Text(text) => Self::Text(text),
            tungstenite::Message::Binary(data) => Self::Binary(data),
            tungstenite::Message::Ping(data) => Self::Ping(data),
            tungstenite::Message::Pong(data) => Self::Pong(data),
            tungstenite::Message::Close(frame) => Self::Close(frame.map(|f| CloseReason {
                code: f.code.into(),
                reason: f.reason.into_owned(),
            })),
            tungstenite::Message::Frame(_) => {
                // Raw frames are internal to tungstenite and never surface
                // through its high-level read API.
                unreachable!("raw frames are not exposed by the websocket stream")
            }
        }
    }
}

impl From<SocketMessage> for tungstenite::Message {
    fn from(message: SocketMessage) -> Self {
        match message {
            SocketMessage::Text(text) => tungstenite::Message::Text(text),
            SocketMessage::Binary(data) => tungstenite::Message::Binary(data),
            SocketMessage::Ping(data) => tungstenite::Message::Ping(data),
            SocketMessage::Pong(data) => tungstenite::Message::Pong(data),
            SocketMessage::Close(reason) => {
                tungstenite::Message::Close(reason.map(|r| tungstenite::protocol::CloseFrame {
                    code: tungstenite::protocol::frame::coding::CloseCode::from(r.code),
                    reason: r.reason.into(),
                }))
            }
        }
    }
}
