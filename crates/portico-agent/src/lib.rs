//! portico-agent: the private half of the portico tunnel.
//!
//! Dials the gateway's control channel, replays forwarded HTTP requests
//! against the local service, and bridges WebSocket sessions to it.

pub mod bridge;
pub mod config;
pub mod control;
pub mod http;
pub mod socket;

pub use config::AgentConfig;
pub use control::{ChannelState, ControlChannel};
