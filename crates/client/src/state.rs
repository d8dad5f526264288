//! Client connection state (C8 data model).
//!
//! `ClientConnState` is a 5-variant sum type rather than an
//! `{authStatus} x {status}` product: `signedOut x connected` is not
//! representable, and `connected` always carries the authoritative
//! [`UserIdentity`] rather than leaving it as a separately-nullable field.

use moltis_protocol::UserIdentity;

/// Who initiated a connect attempt; drives reconnect-policy branching in the
/// reducer (C10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    User,
    Reconnect,
}

/// A previously issued session ticket retained to skip the exchange step on
/// reconnect. Never reused once `expires_at_ms - skew <= now` or the
/// `account_id` it was minted for no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub account_id: String,
    pub token: String,
    pub expires_at_ms: u64,
    pub user: UserIdentity,
}

/// Tagged union over `{authStatus} x {status}`, restricted to the 5 valid
/// combinations: `connecting`/`connected` always carry a known endpoint, and
/// `connected` always carries the resolved `UserIdentity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientConnState {
    SignedOutDisconnected,
    SignedOutConnecting { endpoint: String },
    SignedInDisconnected { account_id: String },
    SignedInConnecting { account_id: String, endpoint: String },
    SignedInConnected { account_id: String, endpoint: String, user: UserIdentity },
}

impl ClientConnState {
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::SignedOutDisconnected | Self::SignedOutConnecting { .. } => None,
            Self::SignedInDisconnected { account_id }
            | Self::SignedInConnecting { account_id, .. }
            | Self::SignedInConnected { account_id, .. } => Some(account_id),
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::SignedOutConnecting { endpoint }
            | Self::SignedInConnecting { endpoint, .. }
            | Self::SignedInConnected { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::SignedOutConnecting { .. } | Self::SignedInConnecting { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::SignedInConnected { .. })
    }

    /// Drops any live endpoint/user, keeping only whatever `account_id` is
    /// already known. Used on every terminal-disconnect transition.
    pub fn to_disconnected(&self) -> Self {
        match self.account_id() {
            Some(id) => Self::SignedInDisconnected { account_id: id.to_string() },
            None => Self::SignedOutDisconnected,
        }
    }

    pub fn to_connecting(&self, endpoint: String) -> Self {
        match self.account_id() {
            Some(id) => Self::SignedInConnecting { account_id: id.to_string(), endpoint },
            None => Self::SignedOutConnecting { endpoint },
        }
    }
}

/// What the reducer is currently waiting on. At most one is ever live; this
/// is structurally guaranteed by storing it as `Option<Pending>` rather than
/// a set of flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Auth {
        interactive: bool,
    },
    ConnectSession {
        origin: ConnectOrigin,
        endpoint: String,
        interactive: bool,
    },
    ConnectExchange {
        origin: ConnectOrigin,
        endpoint: String,
        access_token: String,
        recovered: bool,
    },
    ConnectChannel {
        origin: ConnectOrigin,
        endpoint: String,
        token: String,
        access_token: String,
        used_cached_session: bool,
        recovered: bool,
    },
}

impl Pending {
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Auth { .. } => None,
            Self::ConnectSession { endpoint, .. }
            | Self::ConnectExchange { endpoint, .. }
            | Self::ConnectChannel { endpoint, .. } => Some(endpoint),
        }
    }
}

/// The reducer's full state, mutated only by [`crate::reducer::reduce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerState {
    pub public: ClientConnState,
    pub account_id: Option<String>,
    pub cached_session: Option<CachedSession>,
    pub reconnect_attempt: u32,
    pub reconnect_scheduled: bool,
    pub pending: Option<Pending>,
    pub auth_suppressed_by_user: bool,
    pub clear_session_preference_on_next_sign_in: bool,
}

impl Default for ReducerState {
    fn default() -> Self {
        Self {
            public: ClientConnState::SignedOutDisconnected,
            account_id: None,
            cached_session: None,
            reconnect_attempt: 0,
            reconnect_scheduled: false,
            pending: None,
            auth_suppressed_by_user: false,
            clear_session_preference_on_next_sign_in: false,
        }
    }
}
