//! Control-plane frame codec.
//!
//! Every message on the tunnel transport is a single JSON object carried in
//! a WebSocket text message. The schema is flat: a required `type`, a
//! correlation `id`, and optional fields depending on the type. Bodies are
//! base64 byte strings (the JSON convention for raw bytes) and must
//! round-trip without mutation.
//!
//! Forward compatibility: unknown `type` values decode to
//! [`FrameType::Unknown`] instead of failing, and unknown fields are
//! ignored. Omitted fields default to their zero values.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::config::unix_now;
use crate::error::AgentError;

/// Header key carrying the inner WebSocket message kind on
/// `websocket_data` frames.
pub const MESSAGE_TYPE_HEADER: &str = "message_type";
/// `message_type` value for text messages.
pub const MESSAGE_TYPE_TEXT: &str = "1";
/// `message_type` value for binary messages.
pub const MESSAGE_TYPE_BINARY: &str = "2";

/// The `type` discriminant of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameType {
    HttpRequest,
    HttpResponse,
    WebsocketUpgrade,
    WebsocketUpgradeResponse,
    WebsocketData,
    Ping,
    Pong,
    Terminate,
    Connected,
    /// Any `type` value this agent does not know, kept verbatim for
    /// logging. Ignored, never answered, never disconnected over.
    Unknown(String),
}

impl FrameType {
    fn as_wire(&self) -> &str {
        match self {
            FrameType::HttpRequest => "http_request",
            FrameType::HttpResponse => "http_response",
            FrameType::WebsocketUpgrade => "websocket_upgrade",
            FrameType::WebsocketUpgradeResponse => "websocket_upgrade_response",
            FrameType::WebsocketData => "websocket_data",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Terminate => "terminate",
            FrameType::Connected => "connected",
            FrameType::Unknown(name) => name,
        }
    }

    fn from_wire(name: &str) -> Self {
        match name {
            "http_request" => FrameType::HttpRequest,
            "http_response" => FrameType::HttpResponse,
            "websocket_upgrade" => FrameType::WebsocketUpgrade,
            "websocket_upgrade_response" => FrameType::WebsocketUpgradeResponse,
            "websocket_data" => FrameType::WebsocketData,
            "ping" => FrameType::Ping,
            "pong" => FrameType::Pong,
            "terminate" => FrameType::Terminate,
            "connected" => FrameType::Connected,
            other => FrameType::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for FrameType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for FrameType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(FrameType::from_wire(&name))
    }
}

/// One control-plane message. The `id` correlates request/response pairs
/// and multiplexed WebSocket streams; it is assigned by the edge and opaque
/// to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(
        default,
        with = "base64_body",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(status: &u16) -> bool {
    *status == 0
}

mod base64_body {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(encoded) if encoded.is_empty() => Ok(Vec::new()),
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Frame {
    fn bare(frame_type: FrameType, id: &str) -> Self {
        Frame {
            frame_type,
            id: id.to_string(),
            method: String::new(),
            url: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            status: 0,
            error: String::new(),
            timestamp: unix_now(),
        }
    }

    /// A successful `http_response` correlated to the request `id`.
    pub fn http_response(
        id: &str,
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Frame {
            status,
            headers,
            body,
            ..Frame::bare(FrameType::HttpResponse, id)
        }
    }

    /// A 502 `http_response` for a request the origin could not serve.
    /// The error text is carried both as the body and in `error` so the
    /// edge can log it without decoding the body.
    pub fn error_response(id: &str, message: &str) -> Self {
        Frame {
            status: 502,
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            body: message.as_bytes().to_vec(),
            error: message.to_string(),
            ..Frame::bare(FrameType::HttpResponse, id)
        }
    }

    /// A 101 `websocket_upgrade_response` for a successful local dial.
    pub fn upgrade_response(id: &str, headers: HashMap<String, String>) -> Self {
        Frame {
            status: 101,
            headers,
            ..Frame::bare(FrameType::WebsocketUpgradeResponse, id)
        }
    }

    /// A 502 `websocket_upgrade_response` for a failed local dial.
    pub fn upgrade_failure(id: &str, message: &str) -> Self {
        Frame {
            status: 502,
            error: message.to_string(),
            ..Frame::bare(FrameType::WebsocketUpgradeResponse, id)
        }
    }

    /// A `websocket_data` frame carrying one inner message for stream `id`.
    pub fn websocket_data(id: &str, binary: bool, body: Vec<u8>) -> Self {
        let kind = if binary {
            MESSAGE_TYPE_BINARY
        } else {
            MESSAGE_TYPE_TEXT
        };
        Frame {
            headers: HashMap::from([(MESSAGE_TYPE_HEADER.to_string(), kind.to_string())]),
            body,
            ..Frame::bare(FrameType::WebsocketData, id)
        }
    }

    /// A `pong` answering a JSON `ping` with the same `id`.
    pub fn pong(id: &str) -> Self {
        Frame::bare(FrameType::Pong, id)
    }

    /// Whether a `websocket_data` frame carries a binary inner message.
    pub fn is_binary_data(&self) -> bool {
        self.headers
            .get(MESSAGE_TYPE_HEADER)
            .is_some_and(|v| v == MESSAGE_TYPE_BINARY)
    }

    /// Encode to the wire text.
    pub fn encode(&self) -> Result<String, AgentError> {
        serde_json::to_string(self)
            .map_err(|e| AgentError::TransportFailed(format!("frame encode failed: {e}")))
    }

    /// Decode from the wire text.
    pub fn decode(text: &str) -> Result<Frame, AgentError> {
        serde_json::from_str(text)
            .map_err(|e| AgentError::TransportFailed(format!("frame decode failed: {e}")))
    }
}
