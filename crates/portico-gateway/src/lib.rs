//! portico-gateway: the public half of the portico tunnel.
//!
//! Accepts end-user HTTP requests and WebSocket connections on a single
//! port and relays them, as tunnel messages, over the control channel of
//! the one attached agent.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod control;
pub mod listener;
pub mod server;
pub mod sleep;

pub use config::GatewayConfig;
pub use server::Gateway;
