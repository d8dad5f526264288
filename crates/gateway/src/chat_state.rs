//! Shared state for the chat HTTP/WebSocket surface: the room actor handle,
//! the session issuer, and the handshake-time rate limit/cap bookkeeping.
//!
//! Generalizes `state.rs`'s `GatewayState` (one big struct threaded through
//! axum via `FromRef`) down to just what the chat endpoints need.

use std::{collections::HashSet, sync::Arc, time::Duration};

use moltis_auth::SessionIssuer;
use tokio::sync::Mutex;

use crate::{connection_tracker::ConnectionTracker, rate_limit::RateLimitStore, room::RoomHandle};

/// `/auth/exchange`'s dedicated per-IP rate window (§4.2): 10 requests per
/// minute, kept separate from the C3 connect-rate budget so exchange traffic
/// can't starve `/ws` handshake attempts (or vice versa).
const EXCHANGE_RATE_WINDOW: Duration = Duration::from_millis(60_000);
const EXCHANGE_RATE_MAX_COUNT: u32 = 10;

pub struct ChatState {
    pub session_issuer: SessionIssuer,
    pub room: RoomHandle,
    pub connect_rate: Mutex<RateLimitStore<String>>,
    pub exchange_rate: Mutex<RateLimitStore<String>>,
    pub operator_denylist: HashSet<String>,
    pub max_connections_per_user: u32,
    pub max_connections_per_room: Option<usize>,
    pub tracker: ConnectionTracker,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl ChatState {
    pub fn new(
        session_issuer: SessionIssuer,
        room: RoomHandle,
        connect_rate_window: Duration,
        connect_rate_max_count: u32,
        operator_denylist: HashSet<String>,
        max_connections_per_user: u32,
        max_connections_per_room: Option<usize>,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_issuer,
            room,
            connect_rate: Mutex::new(RateLimitStore::new(connect_rate_window, connect_rate_max_count, 4096)),
            exchange_rate: Mutex::new(RateLimitStore::new(EXCHANGE_RATE_WINDOW, EXCHANGE_RATE_MAX_COUNT, 4096)),
            operator_denylist,
            max_connections_per_user,
            max_connections_per_room,
            tracker: ConnectionTracker::default(),
            ping_interval,
            pong_timeout,
        })
    }
}
