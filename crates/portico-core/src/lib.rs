//! portico-core: shared tunnel protocol for the portico gateway and agent.
//!
//! Provides the JSON tunnel message model and codec, the ordered header type
//! with its host-rewrite stages, WebSocket close-code validation, and
//! correlation id generation.

pub mod close_code;
pub mod codec;
pub mod error;
pub mod headers;
pub mod id;
pub mod message;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_bytes, encode};
pub use error::{PorticoError, PorticoResult};
pub use headers::Headers;
pub use id::{generate_id, short_id};
pub use message::{
    Body, HttpRequest, HttpResponse, MsgKind, TunnelMessage, WsClose, WsFrame, WsOpen,
};
