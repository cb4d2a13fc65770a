//! JSON text framing for the control channel.
//!
//! Wire format: one JSON-encoded [`TunnelMessage`] per WebSocket text frame.

use crate::error::{PorticoError, PorticoResult};
use crate::message::TunnelMessage;

/// Encode a message into the text of one control frame.
pub fn encode(message: &TunnelMessage) -> PorticoResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one control frame.
///
/// Any malformed frame, unknown `type` or unknown `event` is reported as
/// [`PorticoError::InvalidMessage`]; receivers drop those silently.
pub fn decode(text: &str) -> PorticoResult<TunnelMessage> {
    serde_json::from_str(text).map_err(|e| PorticoError::InvalidMessage(e.to_string()))
}

/// Decode a control frame that arrived as binary.
pub fn decode_bytes(data: &[u8]) -> PorticoResult<TunnelMessage> {
    serde_json::from_slice(data).map_err(|e| PorticoError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, WsFrame};

    #[test]
    fn encoded_frame_is_single_line() {
        let msg = TunnelMessage::ws(Body::WsMessage(WsFrame {
            session: "s1".into(),
            data: b"line one\nline two".to_vec(),
            text: true,
        }));
        let text = encode(&msg).unwrap();
        assert!(!text.contains('\n'));
        assert_eq!(decode(&text).unwrap(), msg);
        assert_eq!(decode_bytes(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn garbage_is_invalid_message() {
        assert!(matches!(
            decode("not json"),
            Err(PorticoError::InvalidMessage(_))
        ));
        assert!(matches!(
            decode(r#"{"id":"1","type":"smtp"}"#),
            Err(PorticoError::InvalidMessage(_))
        ));
    }
}
