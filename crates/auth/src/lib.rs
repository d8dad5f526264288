//! Identity and session management for the chat server.
//!
//! - [`session`]: GitHub access-token → HMAC session-ticket exchange (C2).

pub mod session;

pub use session::{SKEW_MS, SessionError, SessionIssuer, SessionTicket};
