//! Wire protocol for the chat channel: versioned tagged messages, identifier
//! invariants, and bounded sizes shared between the server and the client.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version. Frames carrying any other value are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of free-form message text, in Unicode scalar values.
pub const TEXT_MAX_CODEPOINTS: usize = 500;
/// Exact decoded length of a published DM public key.
pub const PUBLIC_KEY_BYTES: usize = 32;
/// Exact decoded length of a DM ciphertext nonce.
pub const NONCE_BYTES: usize = 24;
/// Maximum decoded length of DM ciphertext.
pub const CIPHERTEXT_MAX_BYTES: usize = 4096;
/// Maximum length of an `accountId` string.
pub const ACCOUNT_ID_MAX_CHARS: usize = 32;

/// Inbound raw-message byte cap; larger frames are an immediate close (1009).
pub const WS_MAX_INBOUND_MESSAGE_BYTES: usize = 64 * 1024;
/// Consecutive invalid payloads tolerated before a socket is closed (1008).
pub const WS_MAX_CONSECUTIVE_INVALID_PAYLOADS: u32 = 5;

/// Validation and decoding failures for wire types. Never panics; every
/// constructor returns this instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("text exceeds {TEXT_MAX_CODEPOINTS} code points")]
    TextTooLong,
    #[error("text must not be empty")]
    TextEmpty,
    #[error("invalid accountId {0:?}")]
    InvalidAccountId(String),
    #[error("invalid pairId {0:?}")]
    InvalidPairId(String),
    #[error("{field} must base64-decode to exactly {expected} bytes")]
    WrongDecodedLength { field: &'static str, expected: usize },
    #[error("{field} exceeds {max} bytes")]
    TooLarge { field: &'static str, max: usize },
    #[error("invalid base64 in field {0}")]
    InvalidBase64(&'static str),
}

/// A syntactically valid `accountId`: `^[1-9][0-9]*$`, at most
/// [`ACCOUNT_ID_MAX_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= ACCOUNT_ID_MAX_CHARS
            && raw.as_bytes()[0] != b'0'
            && raw.bytes().all(|b| b.is_ascii_digit());
        if valid {
            Ok(Self(raw))
        } else {
            Err(ProtocolError::InvalidAccountId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric comparison used for canonical ordering (pairId, etc).
    fn numeric_cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.0.len().cmp(&other.0.len()) {
            std::cmp::Ordering::Equal => self.0.cmp(&other.0),
            ord => ord,
        }
    }
}

impl TryFrom<String> for AccountId {
    type Error = ProtocolError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical direct-message pair id: `dm:v1:<min(a,b)>:<max(a,b)>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairId(String);

impl PairId {
    /// Builds the canonical pair id for two accounts, order-independent.
    pub fn of(a: &AccountId, b: &AccountId) -> Self {
        let (lo, hi) = if a.numeric_cmp(b) == std::cmp::Ordering::Greater {
            (b, a)
        } else {
            (a, b)
        };
        Self(format!("dm:v1:{lo}:{hi}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses and validates a pair id, rejecting non-canonical ordering.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let rest = raw
            .strip_prefix("dm:v1:")
            .ok_or_else(|| ProtocolError::InvalidPairId(raw.clone()))?;
        let (a, b) = rest
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidPairId(raw.clone()))?;
        let a = AccountId::parse(a).map_err(|_| ProtocolError::InvalidPairId(raw.clone()))?;
        let b = AccountId::parse(b).map_err(|_| ProtocolError::InvalidPairId(raw.clone()))?;
        if a.numeric_cmp(&b) == std::cmp::Ordering::Greater {
            return Err(ProtocolError::InvalidPairId(raw));
        }
        Ok(Self(raw))
    }
}

impl TryFrom<String> for PairId {
    type Error = ProtocolError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PairId> for String {
    fn from(value: PairId) -> Self {
        value.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role granted to a user; currently only `moderator` exists.
pub mod roles {
    pub const MODERATOR: &str = "moderator";
}

/// The suite identifier for a published DM public identity.
pub mod dm_suite {
    pub const V1: &str = "v1";
}

/// Validated free-form message text, bounded to [`TEXT_MAX_CODEPOINTS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageText(String);

impl MessageText {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ProtocolError::TextEmpty);
        }
        if raw.chars().count() > TEXT_MAX_CODEPOINTS {
            return Err(ProtocolError::TextTooLong);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageText {
    type Error = ProtocolError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<MessageText> for String {
    fn from(value: MessageText) -> Self {
        value.0
    }
}

/// Base64 (standard, padded) payload decoding to an exact byte length.
fn decode_exact(field: &'static str, raw: &str, expected: usize) -> Result<Vec<u8>, ProtocolError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| ProtocolError::InvalidBase64(field))?;
    if bytes.len() != expected {
        return Err(ProtocolError::WrongDecodedLength { field, expected });
    }
    Ok(bytes)
}

/// Base64 payload decoding bounded by a maximum byte length.
fn decode_bounded(field: &'static str, raw: &str, max: usize) -> Result<Vec<u8>, ProtocolError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| ProtocolError::InvalidBase64(field))?;
    if bytes.len() > max {
        return Err(ProtocolError::TooLarge { field, max });
    }
    Ok(bytes)
}

/// A user's identity, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub account_id: AccountId,
    pub login: String,
    pub avatar_url: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserIdentity {
    pub fn is_moderator(&self) -> bool {
        self.roles.iter().any(|r| r == roles::MODERATOR)
    }
}

/// A published DM public identity, checked to decode to exactly
/// [`PUBLIC_KEY_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub suite: String,
    pub public_key: String,
}

impl PublicIdentity {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.suite != dm_suite::V1 {
            return Err(ProtocolError::InvalidBase64("suite"));
        }
        decode_exact("publicKey", &self.public_key, PUBLIC_KEY_BYTES)?;
        Ok(())
    }
}

/// A plaintext room message, as stored in history and broadcast to sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainFrame {
    pub id: String,
    pub user: UserIdentity,
    pub text: String,
    pub created_at: String,
}

/// A DM ciphertext frame. The server never decodes `ciphertext` or `nonce`
/// beyond validating their decoded length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextFrame {
    pub id: String,
    pub pair_id: String,
    pub sender: UserIdentity,
    pub recipient_account_id: String,
    pub sender_identity: PublicIdentity,
    pub recipient_identity: PublicIdentity,
    pub nonce: String,
    pub ciphertext: String,
    pub created_at: String,
}

impl CiphertextFrame {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        decode_exact("nonce", &self.nonce, NONCE_BYTES)?;
        decode_bounded("ciphertext", &self.ciphertext, CIPHERTEXT_MAX_BYTES)?;
        self.sender_identity.validate()?;
        self.recipient_identity.validate()?;
        Ok(())
    }
}

/// A presence snapshot entry: one account and its connection count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub account_id: String,
    pub login: String,
    pub connections: u32,
}

/// Wire error codes. A deliberately small, closed vocabulary distinct from
/// the internal `thiserror` error types (see `ProtocolError` and the
/// gateway's `RoomError`/`HandshakeError`): this is only what the client
/// reducer matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorCode {
    InvalidPayload,
    Forbidden,
    RateLimited,
    AuthExpired,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: WireErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Handshake-rejection HTTP body codes (distinct closed set from
/// [`WireErrorCode`] — these never travel as channel frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeRejectionCode {
    RateLimited,
    RoomFull,
    TooManyConnections,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRejection {
    pub code: HandshakeRejectionCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Client → server channel frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Hello,
    #[serde(rename_all = "camelCase")]
    MessageSend {
        text: String,
        #[serde(default)]
        client_message_id: Option<String>,
    },
    #[serde(rename = "dm.identity.publish", rename_all = "camelCase")]
    DmIdentityPublish { identity: PublicIdentity },
    #[serde(rename = "dm.open", rename_all = "camelCase")]
    DmOpen { target_account_id: String },
    #[serde(rename = "dm.message.send", rename_all = "camelCase")]
    DmMessageSend {
        pair_id: String,
        recipient_account_id: String,
        sender_identity: PublicIdentity,
        recipient_identity: PublicIdentity,
        nonce: String,
        ciphertext: String,
    },
    #[serde(rename = "moderation.user.deny", rename_all = "camelCase")]
    ModerationUserDeny {
        target_account_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "moderation.user.allow", rename_all = "camelCase")]
    ModerationUserAllow { target_account_id: String },
}

/// Server → client channel frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Welcome {
        user: UserIdentity,
        server_time: String,
        history: Vec<PlainFrame>,
    },
    #[serde(rename_all = "camelCase")]
    MessageNew {
        message: PlainFrame,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
    },
    #[serde(rename = "dm.welcome", rename_all = "camelCase")]
    DmWelcome {
        pair_id: String,
        peer_account_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_identity: Option<PublicIdentity>,
        history: Vec<CiphertextFrame>,
    },
    #[serde(rename = "dm.message.new", rename_all = "camelCase")]
    DmMessageNew { message: CiphertextFrame },
    Presence {
        snapshot: Vec<PresenceEntry>,
    },
    #[serde(rename = "moderation.snapshot", rename_all = "camelCase")]
    ModerationSnapshot { denylist: Vec<String> },
    #[serde(rename = "moderation.user.denied", rename_all = "camelCase")]
    ModerationUserDenied { actor: String, target: String },
    #[serde(rename = "moderation.user.allowed", rename_all = "camelCase")]
    ModerationUserAllowed { actor: String, target: String },
    Error(ErrorBody),
}

/// A frame plus the protocol version it was sent under (§4.1). `version`
/// sits alongside the tagged frame's own fields on the wire, not nested
/// under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u32,
    #[serde(flatten)]
    pub frame: T,
}

/// Serializes a server frame with the current protocol version.
pub fn encode_server_frame(frame: ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Versioned { version: PROTOCOL_VERSION, frame })
}

/// Serializes a client frame with the current protocol version.
pub fn encode_client_frame(frame: ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Versioned { version: PROTOCOL_VERSION, frame })
}

/// Parses a client frame from wire JSON, rejecting anything malformed or not
/// at [`PROTOCOL_VERSION`] — the gateway's read loop treats both the same
/// way (an invalid-payload strike), so this collapses them into one `None`.
pub fn decode_client_frame(text: &str) -> Option<ClientFrame> {
    let envelope: Versioned<ClientFrame> = serde_json::from_str(text).ok()?;
    (envelope.version == PROTOCOL_VERSION).then_some(envelope.frame)
}

/// Parses a server frame from wire JSON, returning `None` if it's malformed
/// or carries a version other than [`PROTOCOL_VERSION`].
pub fn decode_server_frame(text: &str) -> Option<ServerFrame> {
    let envelope: Versioned<ServerFrame> = serde_json::from_str(text).ok()?;
    (envelope.version == PROTOCOL_VERSION).then_some(envelope.frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_rejects_leading_zero() {
        assert!(AccountId::parse("0123").is_err());
        assert!(AccountId::parse("123").is_ok());
        assert!(AccountId::parse("").is_err());
    }

    #[test]
    fn pair_id_canonical_order() {
        let a = AccountId::parse("2").unwrap();
        let b = AccountId::parse("1").unwrap();
        assert_eq!(PairId::of(&a, &b).as_str(), "dm:v1:1:2");
        assert_eq!(PairId::of(&b, &a).as_str(), "dm:v1:1:2");
    }

    #[test]
    fn pair_id_rejects_non_canonical() {
        assert!(PairId::parse("dm:v1:2:1").is_err());
        assert!(PairId::parse("dm:v1:1:2").is_ok());
    }

    #[test]
    fn pair_id_numeric_not_lexical() {
        // "9" < "10" lexically would be wrong; numeric compare must treat 10 > 9.
        let a = AccountId::parse("10").unwrap();
        let b = AccountId::parse("9").unwrap();
        assert_eq!(PairId::of(&a, &b).as_str(), "dm:v1:9:10");
    }

    #[test]
    fn message_text_bounds() {
        assert!(MessageText::parse("").is_err());
        assert!(MessageText::parse("x".repeat(500)).is_ok());
        assert!(MessageText::parse("x".repeat(501)).is_err());
    }

    #[test]
    fn client_frame_tags_round_trip() {
        let raw = serde_json::json!({"type": "dm.open", "targetAccountId": "1"});
        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        assert!(matches!(frame, ClientFrame::DmOpen { .. }));
    }

    #[test]
    fn message_send_round_trips_client_message_id() {
        let raw = serde_json::json!({
            "type": "message.send",
            "text": "hi",
            "clientMessageId": "abc",
        });
        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ClientFrame::MessageSend { text, client_message_id } => {
                assert_eq!(text, "hi");
                assert_eq!(client_message_id.as_deref(), Some("abc"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn encode_decode_client_frame_round_trips() {
        let frame = ClientFrame::MessageSend { text: "hi".into(), client_message_id: None };
        let json = encode_client_frame(frame).unwrap();
        assert!(json.contains("\"version\":1"));
        assert!(matches!(decode_client_frame(&json), Some(ClientFrame::MessageSend { .. })));
    }

    #[test]
    fn decode_client_frame_rejects_wrong_version() {
        let raw = serde_json::json!({"version": 2, "type": "dm.open", "targetAccountId": "1"});
        assert!(decode_client_frame(&raw.to_string()).is_none());
    }

    #[test]
    fn decode_client_frame_rejects_missing_version() {
        let raw = serde_json::json!({"type": "dm.open", "targetAccountId": "1"});
        assert!(decode_client_frame(&raw.to_string()).is_none());
    }

    #[test]
    fn error_body_omits_absent_fields() {
        let body = ErrorBody {
            code: WireErrorCode::RateLimited,
            message: None,
            retry_after_ms: Some(500),
            client_message_id: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert!(v.get("message").is_none());
        assert_eq!(v["retryAfterMs"], 500);
    }
}
