//! Tunnel messages: the only unit that crosses the control channel.
//!
//! Every message is a JSON object `{id, type, event, payload}`. The `type`
//! selects the handler (`http` or `ws`), the `event` selects the payload
//! shape. Binary content (HTTP bodies, WebSocket frames) is base64-encoded.

use crate::error::PorticoError;
use crate::headers::Headers;
use crate::id::generate_id;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

/// Top-level message type, `type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Http,
    Ws,
}

/// A correlated tunnel message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Wire")]
pub struct TunnelMessage {
    /// Correlation token. HTTP responses echo the id of their request.
    pub id: String,
    pub body: Body,
}

/// Type-specific content of a [`TunnelMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    WsOpen(WsOpen),
    WsClose(WsClose),
    WsMessage(WsFrame),
}

// ── Payloads ─────────────────────────────────────────────────────────

/// An end-user HTTP request forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// The local service's reply, posted back to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// A bridge session opened (gateway → agent) or its local half connected
/// (agent → gateway).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsOpen {
    #[serde(default)]
    pub session: String,
    /// Original end-user path, including the query string.
    #[serde(default)]
    pub path: String,
}

/// A bridge session closed from either side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsClose {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One WebSocket frame relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(default)]
    pub session: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// `true` for a text frame, `false` for a binary frame.
    #[serde(default)]
    pub text: bool,
}

impl TunnelMessage {
    pub fn http_request(id: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            id: id.into(),
            body: Body::HttpRequest(request),
        }
    }

    pub fn http_response(id: impl Into<String>, response: HttpResponse) -> Self {
        Self {
            id: id.into(),
            body: Body::HttpResponse(response),
        }
    }

    /// A WebSocket event with a fresh id.
    pub fn ws(body: Body) -> Self {
        Self {
            id: generate_id(),
            body,
        }
    }

    pub fn kind(&self) -> MsgKind {
        match self.body {
            Body::HttpRequest(_) | Body::HttpResponse(_) => MsgKind::Http,
            Body::WsOpen(_) | Body::WsClose(_) | Body::WsMessage(_) => MsgKind::Ws,
        }
    }

    /// The wire `event` name.
    pub fn event(&self) -> &'static str {
        match self.body {
            Body::HttpRequest(_) => "request",
            Body::HttpResponse(_) => "response",
            Body::WsOpen(_) => "open",
            Body::WsClose(_) => "close",
            Body::WsMessage(_) => "message",
        }
    }
}

// ── Wire form ────────────────────────────────────────────────────────

impl Serialize for TunnelMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("TunnelMessage", 4)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("type", &self.kind())?;
        s.serialize_field("event", self.event())?;
        match &self.body {
            Body::HttpRequest(p) => s.serialize_field("payload", p)?,
            Body::HttpResponse(p) => s.serialize_field("payload", p)?,
            Body::WsOpen(p) => s.serialize_field("payload", p)?,
            Body::WsClose(p) => s.serialize_field("payload", p)?,
            Body::WsMessage(p) => s.serialize_field("payload", p)?,
        }
        s.end()
    }
}

/// Loosely-typed envelope used while decoding.
///
/// The payload stays raw until the event is known so header order and
/// repeated header names survive decoding.
#[derive(Deserialize)]
struct Wire {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

fn payload<T: serde::de::DeserializeOwned>(raw: Option<Box<RawValue>>) -> Result<T, PorticoError> {
    let text = raw.as_deref().map(RawValue::get).unwrap_or("{}");
    serde_json::from_str(text).map_err(|e| PorticoError::InvalidMessage(e.to_string()))
}

impl TryFrom<Wire> for TunnelMessage {
    type Error = PorticoError;

    fn try_from(wire: Wire) -> Result<Self, PorticoError> {
        let body = match (wire.kind.as_str(), wire.event.as_str()) {
            ("http", "request") => Body::HttpRequest(payload(wire.payload)?),
            ("http", "response") => Body::HttpResponse(payload(wire.payload)?),
            ("ws", "open") => Body::WsOpen(payload(wire.payload)?),
            ("ws", "close") => Body::WsClose(payload(wire.payload)?),
            ("ws", "message") => Body::WsMessage(payload(wire.payload)?),
            ("http" | "ws", event) => {
                return Err(PorticoError::InvalidMessage(format!(
                    "unknown {} event: {event:?}",
                    wire.kind
                )))
            }
            (kind, _) => {
                return Err(PorticoError::InvalidMessage(format!(
                    "unknown message type: {kind:?}"
                )))
            }
        };
        Ok(Self { id: wire.id, body })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
