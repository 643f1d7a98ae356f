//! JSON wire protocol for room messages.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! { "code": "<room identifier>", "message": "<payload>" }
//! ```
//!
//! Both fields default to the empty string when absent and unknown fields
//! are ignored. The empty code is a room like any other.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::ConnectionId;
use crate::error::ProtocolError;

/// A message as peers see it on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Room identifier
    #[serde(default)]
    pub code: String,
    /// Opaque payload, relayed untouched
    #[serde(default)]
    pub message: String,
}

impl RoomMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }

    /// Encode into a text frame ready to be shared between recipients.
    pub fn to_frame(&self) -> Result<Message, ProtocolError> {
        Ok(Message::text(self.encode()?))
    }
}

/// A decoded message travelling from an ingress handler to the broadcast loop.
///
/// `origin` identifies the sending connection and never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: RoomMessage,
    pub origin: ConnectionId,
}

impl Envelope {
    pub fn new(message: RoomMessage, origin: ConnectionId) -> Self {
        Self { message, origin }
    }

    pub fn room(&self) -> &str {
        &self.message.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_message() {
        let msg = RoomMessage::decode(br#"{"code":"room1","message":"hello"}"#).unwrap();
        assert_eq!(msg, RoomMessage::new("room1", "hello"));
    }

    #[test]
    fn test_decode_missing_fields_default_to_empty() {
        let msg = RoomMessage::decode(br#"{"message":"no room"}"#).unwrap();
        assert_eq!(msg.code, "");
        assert_eq!(msg.message, "no room");

        let msg = RoomMessage::decode(b"{}").unwrap();
        assert_eq!(msg, RoomMessage::default());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let msg =
            RoomMessage::decode(br#"{"code":"x","message":"y","sender":"alice","n":3}"#).unwrap();
        assert_eq!(msg, RoomMessage::new("x", "y"));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(
            RoomMessage::decode(b"not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(RoomMessage::decode(br#"{"code":42,"message":"x"}"#).is_err());
        assert!(RoomMessage::decode(br#""just a string""#).is_err());
    }

    #[test]
    fn test_encode_has_exactly_two_fields() {
        let envelope = Envelope::new(RoomMessage::new("lobby", "hi"), ConnectionId::new());
        let json = envelope.message.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["code"], "lobby");
        assert_eq!(obj["message"], "hi");
    }

    #[test]
    fn test_to_frame_is_text() {
        let frame = RoomMessage::new("", "empty room").to_frame().unwrap();
        match frame {
            Message::Text(text) => {
                assert_eq!(text.as_str(), r#"{"code":"","message":"empty room"}"#);
            }
            other => panic!("Expected text frame, got {other:?}"),
        }
    }
}
