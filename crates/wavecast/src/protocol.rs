//! Pluggable wire protocol.
//!
//! A protocol splits an event name from a payload, decodes payloads into the
//! intermediate value typed handlers deserialize from, and encodes outbound
//! values back into wire bytes. The default [`JsonProtocol`] frames events as
//! UTF-8 text: `<event-name>` + a single space + `<JSON payload>`, e.g.
//! `chat.message {"text":"hi"}`.

use crate::error::ProtocolError;
use crate::types::FrameKind;
use serde_json::Value;

/// Wire codec used by the router and everything that emits events.
///
/// Implementations must be cheap to call concurrently; the broker shares one
/// instance across all connections.
pub trait Protocol: Send + Sync {
    /// Split the event name from the rest of the frame.
    fn unpack<'a>(&self, raw: &'a [u8]) -> Result<(&'a str, &'a [u8]), ProtocolError>;

    /// Decode a payload into the intermediate value handlers are built from.
    fn unmarshal(&self, payload: &[u8]) -> Result<Value, ProtocolError>;

    /// Encode a value into payload bytes.
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, ProtocolError>;

    /// Join an event name and payload bytes into a complete wire frame.
    fn pack(&self, event: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Frame kind this protocol consumes.
    fn read_kind(&self) -> FrameKind {
        FrameKind::Text
    }

    /// Frame kind this protocol produces.
    fn write_kind(&self) -> FrameKind {
        FrameKind::Text
    }
}

const SEPARATOR: char = ' ';

/// The default JSON protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProtocol;

impl Protocol for JsonProtocol {
    fn unpack<'a>(&self, raw: &'a [u8]) -> Result<(&'a str, &'a [u8]), ProtocolError> {
        let text = std::str::from_utf8(raw)?;
        match text.split_once(SEPARATOR) {
            Some((event, payload)) if !event.is_empty() => Ok((event, payload.as_bytes())),
            _ => Err(ProtocolError::MissingSeparator),
        }
    }

    fn unmarshal(&self, payload: &[u8]) -> Result<Value, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn pack(&self, event: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if event.is_empty() || event.contains(SEPARATOR) {
            return Err(ProtocolError::Encode(format!(
                "event name {event:?} must be non-empty and free of separators"
            )));
        }
        let mut frame = Vec::with_capacity(event.len() + 1 + payload.len());
        frame.extend_from_slice(event.as_bytes());
        frame.push(SEPARATOR as u8);
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}
