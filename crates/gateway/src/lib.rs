//! Gateway: the chat server's HTTP/WebSocket surface.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Spawn the room actor
//! 3. Bind and serve `/health`, `/auth/exchange`, `/telemetry`, `/ws`

pub mod chat_state;
pub mod connection_tracker;
pub mod error_response;
pub mod heartbeat;
pub mod rate_limit;
pub mod room;
pub mod server;
pub mod ws;
