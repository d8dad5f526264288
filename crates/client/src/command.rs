//! Effects the reducer asks the runtime (C9) to perform. The reducer never
//! executes these itself — it only returns them.

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetIdentity { interactive: bool, clear_pref: bool },
    Exchange { endpoint: String, access_token: String },
    ChannelOpen { endpoint: String, token: String },
    ChannelClose { code: u16, reason: String },
    ReconnectCancel,
    ReconnectSchedule { delay_ms: u64 },
    /// Fire-and-forget; `fields` is whatever shape that event name documents.
    Telemetry { event: &'static str, fields: serde_json::Value },
    /// Surfaced to the user. Only ever emitted on an `origin: user` failure
    /// path.
    Raise { message: String, code: Option<&'static str> },
}
