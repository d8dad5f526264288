//! Inputs to the reducer (C8): UI intents, identity-provider/exchange/channel
//! results, and timer firings. `now_ms` always arrives on the event rather
//! than being read from the clock inside the reducer.

use moltis_protocol::UserIdentity;

use crate::state::ConnectOrigin;

/// The identity-provider adapter's result: an opaque access token bound to
/// an accountId. Profile fetching (login, avatar) is an external
/// collaborator — not resolved until the session exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySession {
    pub account_id: String,
    pub access_token: String,
}

/// Why `/auth/exchange` failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeErrorKind {
    Http { status: u16 },
    InvalidResponse,
    Network,
}

/// A successful `/auth/exchange` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOk {
    pub token: String,
    pub expires_at_ms: u64,
    pub user: UserIdentity,
}

/// Why the channel upgrade failed. `retry_after_ms`/`body_code`/`body_text`
/// are already reconciled by the runtime (header wins over body) before
/// this reaches the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenErrorKind {
    HandshakeHttp {
        status: u16,
        retry_after_ms: Option<u64>,
        body_code: Option<String>,
        body_text: Option<String>,
    },
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    AuthRefresh,
    UiSignIn,
    UiSignOut,
    UiConnect { origin: ConnectOrigin, endpoint: String, interactive: bool },
    UiDisconnect,
    IdentityResult { ok: bool, session: Option<IdentitySession>, error: Option<String>, now_ms: u64 },
    ExchangeResult { ok: bool, session: Option<ExchangeOk>, error: Option<ExchangeErrorKind> },
    ChannelOpenResult { ok: bool, error: Option<ChannelOpenErrorKind> },
    ChannelClosed { auto_reconnect_enabled: bool },
    ChannelWelcome { user: UserIdentity },
    TimerReconnectFired { endpoint: String },
}
