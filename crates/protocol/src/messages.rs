//! Terminal channel message definitions.
//!
//! Messages travel as JSON text frames over the WebSocket attached to a
//! session. Every frame is run through [`Frame::decode`], which makes the
//! raw-passthrough fallback explicit: a frame that is not JSON at all is
//! forwarded verbatim instead of being rejected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Messages sent from an attached client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the shell.
    Input { data: String },
    /// New viewport geometry.
    Resize { cols: u16, rows: u16 },
}

/// Messages sent from the daemon to an attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal output (also used for the scrollback replay on attach).
    Output { data: String },
    /// The session has ended; no further messages follow.
    Exit,
}

impl ClientMessage {
    /// Build an input message.
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl ServerMessage {
    /// Build an output message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Returns true for the terminal `exit` notice.
    pub fn is_exit(&self) -> bool {
        matches!(self, ServerMessage::Exit)
    }
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<M> {
    /// A well-formed tagged message.
    Structured(M),
    /// Not JSON; pass the text through unchanged.
    Raw(String),
    /// Valid JSON that is not a known message, including non-object values
    /// such as `42`. Ignored by receivers.
    Unrecognized,
}

impl<M: DeserializeOwned> Frame<M> {
    /// Decode a text frame.
    ///
    /// Text that fails to parse as JSON is raw passthrough. Parsed JSON that
    /// does not match a known message, objects and scalars alike, is
    /// [`Frame::Unrecognized`].
    pub fn decode(text: &str) -> Self {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => value,
            Err(_) => return Frame::Raw(text.to_string()),
        };

        match serde_json::from_value::<M>(value) {
            Ok(message) => Frame::Structured(message),
            Err(_) => Frame::Unrecognized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_input_wire_shape() {
        let json = ClientMessage::input("ls\r").to_json().unwrap();
        assert_eq!(json, r#"{"type":"input","data":"ls\r"}"#);
    }

    #[test]
    fn test_client_resize_wire_shape() {
        let json = ClientMessage::Resize { cols: 120, rows: 40 }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);
    }

    #[test]
    fn test_server_output_wire_shape() {
        let json = ServerMessage::output("hello").to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hello"}"#);
    }

    #[test]
    fn test_server_exit_wire_shape() {
        let json = ServerMessage::Exit.to_json().unwrap();
        assert_eq!(json, r#"{"type":"exit"}"#);
        assert!(ServerMessage::Exit.is_exit());
        assert!(!ServerMessage::output("x").is_exit());
    }

    #[test]
    fn test_decode_structured_input() {
        let frame = Frame::<ClientMessage>::decode(r#"{"type":"input","data":"pwd\r"}"#);
        assert_eq!(frame, Frame::Structured(ClientMessage::input("pwd\r")));
    }

    #[test]
    fn test_decode_structured_resize() {
        let frame = Frame::<ClientMessage>::decode(r#"{"type":"resize","cols":80,"rows":24}"#);
        assert_eq!(
            frame,
            Frame::Structured(ClientMessage::Resize { cols: 80, rows: 24 })
        );
    }

    #[test]
    fn test_decode_non_json_is_raw() {
        let frame = Frame::<ClientMessage>::decode("echo hi\r");
        assert_eq!(frame, Frame::Raw("echo hi\r".to_string()));
    }

    #[test]
    fn test_decode_truncated_json_is_raw() {
        let frame = Frame::<ClientMessage>::decode(r#"{"type":"input","#);
        assert_eq!(frame, Frame::Raw(r#"{"type":"input","#.to_string()));
    }

    #[test]
    fn test_decode_json_scalar_is_unrecognized() {
        assert_eq!(Frame::<ClientMessage>::decode("42"), Frame::Unrecognized);
        assert_eq!(Frame::<ClientMessage>::decode("\"q\""), Frame::Unrecognized);
        assert_eq!(Frame::<ClientMessage>::decode("null"), Frame::Unrecognized);
        assert_eq!(Frame::<ClientMessage>::decode("[1,2]"), Frame::Unrecognized);
    }

    #[test]
    fn test_decode_unknown_type_is_unrecognized() {
        let frame = Frame::<ClientMessage>::decode(r#"{"type":"ping"}"#);
        assert_eq!(frame, Frame::Unrecognized);
    }

    #[test]
    fn test_decode_wrong_field_type_is_unrecognized() {
        let frame = Frame::<ClientMessage>::decode(r#"{"type":"resize","cols":"wide","rows":1}"#);
        assert_eq!(frame, Frame::Unrecognized);
    }

    #[test]
    fn test_decode_server_frames() {
        assert_eq!(
            Frame::<ServerMessage>::decode(r#"{"type":"exit"}"#),
            Frame::Structured(ServerMessage::Exit)
        );
        assert_eq!(
            Frame::<ServerMessage>::decode(r#"{"type":"output","data":"$ "}"#),
            Frame::Structured(ServerMessage::output("$ "))
        );
        assert_eq!(
            Frame::<ServerMessage>::decode("plain text"),
            Frame::Raw("plain text".to_string())
        );
    }
}
