//! Wire protocol: binary terminal frames and JSON control messages coexisting
//! on one message channel. Binary frames carry raw PTY bytes; control
//! messages carry lifecycle/liveness info as a closed set of tagged variants.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Binary commands sent client→server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientBinaryCommand {
    /// Raw bytes to write to shell stdin.
    Input,
    /// Payload is the JSON text `{"columns":N,"rows":N}`.
    Resize,
}

impl ClientBinaryCommand {
    fn tag(self) -> u8 {
        match self {
            ClientBinaryCommand::Input => b'0',
            ClientBinaryCommand::Resize => b'1',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'0' => Some(Self::Input),
            b'1' => Some(Self::Resize),
            _ => None,
        }
    }
}

/// Binary commands sent server→client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerBinaryCommand {
    /// Raw bytes from shell stdout, pass-through, no transformation.
    Output,
    /// UTF-8 title bytes.
    SetWindowTitle,
    /// Reserved, ignored by the core.
    SetPreferences,
}

impl ServerBinaryCommand {
    fn tag(self) -> u8 {
        match self {
            ServerBinaryCommand::Output => b'0',
            ServerBinaryCommand::SetWindowTitle => b'1',
            ServerBinaryCommand::SetPreferences => b'2',
        }
    }
}

/// Encode a server→client binary frame: one tag byte followed by the payload.
pub fn encode_server_frame(cmd: ServerBinaryCommand, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(cmd.tag());
    out.extend_from_slice(payload);
    out
}

/// Encode a client→server binary frame. Exposed for the client driver and
/// for tests exercising the codec from both ends.
pub fn encode_client_frame(cmd: ClientBinaryCommand, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(cmd.tag());
    out.extend_from_slice(payload);
    out
}

/// Decode a client→server binary frame. A zero-length frame fails; an
/// unknown tag is reported so the caller can silently drop it (per the
/// codec rule: unknown tags are dropped, not treated as protocol errors).
pub fn decode_client_frame(bytes: &[u8]) -> Result<(Option<ClientBinaryCommand>, &[u8]), ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let (tag, payload) = bytes.split_at(1);
    Ok((ClientBinaryCommand::from_tag(tag[0]), payload))
}

/// Transport-agnostic output of a session actor, translated by whichever
/// connection handler owns the real channel (an Axum WebSocket in the
/// server, a stub in tests) into that transport's message type.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePayload {
    pub columns: i64,
    pub rows: i64,
}

pub fn encode_resize_payload(columns: i64, rows: i64) -> Vec<u8> {
    serde_json::to_vec(&ResizePayload { columns, rows }).expect("resize payload always serializes")
}

pub fn decode_resize_payload(payload: &[u8]) -> Result<ResizePayload, ProtocolError> {
    serde_json::from_slice(payload).map_err(ProtocolError::MalformedControl)
}

/// Control messages sent client→server, as a closed tagged sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControlMessage {
    Handshake { columns: i64, rows: i64 },
    Reconnect {
        #[serde(rename = "sessionId")]
        session_id: String,
        columns: i64,
        rows: i64,
    },
    Pong { timestamp: i64 },
}

/// Control messages sent server→client, as a closed tagged sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControlMessage {
    SessionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping { timestamp: i64 },
    SessionEnded {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    Error { message: String },
}

impl ClientControlMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::MalformedControl)
    }
}

impl ServerControlMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("control message always serializes")
    }
}

/// Build a handshake message, rejecting non-finite or non-positive
/// dimensions with a typed error. Other call sites (e.g. resize) clamp
/// defensively instead of rejecting — see `session::clamp_dimensions`.
pub fn build_handshake(columns: i64, rows: i64) -> Result<ClientControlMessage, ProtocolError> {
    if columns <= 0 || rows <= 0 {
        return Err(ProtocolError::InvalidDimensions { columns, rows });
    }
    Ok(ClientControlMessage::Handshake { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_handshake_rejects_non_positive_dimensions() {
        assert!(build_handshake(0, 24).is_err());
        assert!(build_handshake(80, -1).is_err());
        assert!(build_handshake(80, 24).is_ok());
    }

    #[test]
    fn decode_empty_frame_fails() {
        assert!(decode_client_frame(&[]).is_err());
    }

    #[test]
    fn decode_unknown_tag_returns_none_command_not_error() {
        let (cmd, payload) = decode_client_frame(b"9hello").unwrap();
        assert!(cmd.is_none());
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn input_frame_roundtrip() {
        let encoded = encode_client_frame(ClientBinaryCommand::Input, b"ls\n");
        let (cmd, payload) = decode_client_frame(&encoded).unwrap();
        assert_eq!(cmd, Some(ClientBinaryCommand::Input));
        assert_eq!(payload, b"ls\n");
    }

    #[test]
    fn resize_payload_roundtrip() {
        let encoded = encode_resize_payload(80, 24);
        let decoded = decode_resize_payload(&encoded).unwrap();
        assert_eq!(decoded.columns, 80);
        assert_eq!(decoded.rows, 24);
    }

    #[test]
    fn server_output_frame_has_leading_tag_byte() {
        let frame = encode_server_frame(ServerBinaryCommand::Output, b"hi");
        assert_eq!(frame[0], b'0');
        assert_eq!(&frame[1..], b"hi");
    }

    #[test]
    fn client_control_message_wire_shape() {
        let msg = ClientControlMessage::decode(
            r#"{"type":"reconnect","sessionId":"abc","columns":80,"rows":24}"#,
        )
        .unwrap();
        match msg {
            ClientControlMessage::Reconnect { session_id, columns, rows } => {
                assert_eq!(session_id, "abc");
                assert_eq!(columns, 80);
                assert_eq!(rows, 24);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_control_message_wire_shape() {
        let encoded = ServerControlMessage::SessionInfo { session_id: "abc".into() }.encode();
        assert!(encoded.contains(r#""type":"session_info""#));
        assert!(encoded.contains(r#""sessionId":"abc""#));
    }

    #[test]
    fn malformed_control_json_is_protocol_error() {
        assert!(ClientControlMessage::decode("not json").is_err());
        assert!(ClientControlMessage::decode(r#"{"type":"bogus"}"#).is_err());
    }
}
