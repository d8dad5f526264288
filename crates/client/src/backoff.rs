//! Reconnect policy (C10): exponential backoff and 429-body classification.

/// Clock skew tolerated between session-ticket mint and reuse, per the
/// `CachedSession` freshness invariant.
pub const SESSION_SKEW_MS: u64 = 30_000;

/// `min(30_000, 500 * 2^min(attempt,6))`, deterministic.
#[must_use]
pub fn local_backoff(attempt: u32) -> u64 {
    let exponent = attempt.min(6);
    (500u64 * (1u64 << exponent)).min(30_000)
}

/// Classification of a handshake-rejection 429 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRejectionClass {
    RateLimited,
    RoomFull,
    TooManyConnections,
    Unknown,
}

/// Applies the classification rules in order: a structured `code` wins, then
/// presence of `retryAfterMs`, then best-effort substring matching on the
/// body text, then `Unknown`.
#[must_use]
pub fn classify_handshake_rejection(
    body_code: Option<&str>,
    body_text: Option<&str>,
    retry_after_ms: Option<u64>,
) -> HandshakeRejectionClass {
    if let Some(code) = body_code {
        match code {
            "rate_limited" => return HandshakeRejectionClass::RateLimited,
            "room_full" => return HandshakeRejectionClass::RoomFull,
            "too_many_connections" => return HandshakeRejectionClass::TooManyConnections,
            _ => {},
        }
    }
    if retry_after_ms.is_some() {
        return HandshakeRejectionClass::RateLimited;
    }
    if let Some(text) = body_text {
        let lower = text.to_lowercase();
        if lower.contains("too many connection attempts") {
            return HandshakeRejectionClass::RateLimited;
        }
        if lower.contains("room is full") {
            return HandshakeRejectionClass::RoomFull;
        }
        if lower.contains("too many connections") {
            return HandshakeRejectionClass::TooManyConnections;
        }
    }
    HandshakeRejectionClass::Unknown
}

/// A human-readable message for the `raise` command on an `origin: user`
/// handshake-rejection failure.
#[must_use]
pub fn human_message(class: HandshakeRejectionClass, retry_after_ms: Option<u64>) -> String {
    let suffix = retry_after_ms
        .map(|ms| format!(" Try again in {} seconds.", ms.div_ceil(1000)))
        .unwrap_or_default();
    match class {
        HandshakeRejectionClass::RateLimited => format!("You're reconnecting too quickly.{suffix}"),
        HandshakeRejectionClass::RoomFull => "The room is full.".to_string(),
        HandshakeRejectionClass::TooManyConnections => {
            "You already have too many open connections.".to_string()
        },
        HandshakeRejectionClass::Unknown => "Could not connect to the chat server.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_bounds() {
        assert_eq!(local_backoff(0), 500);
        assert_eq!(local_backoff(1), 1000);
        assert_eq!(local_backoff(6), 30_000);
        assert_eq!(local_backoff(7), 30_000);
        assert_eq!(local_backoff(100), 30_000);
    }

    #[test]
    fn structured_code_wins_over_text() {
        let class = classify_handshake_rejection(Some("room_full"), Some("too many connections"), None);
        assert_eq!(class, HandshakeRejectionClass::RoomFull);
    }

    #[test]
    fn retry_after_without_code_is_rate_limited() {
        let class = classify_handshake_rejection(None, None, Some(5_000));
        assert_eq!(class, HandshakeRejectionClass::RateLimited);
    }

    #[test]
    fn text_fallback_classifies_each_literal() {
        assert_eq!(
            classify_handshake_rejection(None, Some("Too many connection attempts"), None),
            HandshakeRejectionClass::RateLimited
        );
        assert_eq!(
            classify_handshake_rejection(None, Some("the room is full right now"), None),
            HandshakeRejectionClass::RoomFull
        );
        assert_eq!(
            classify_handshake_rejection(None, Some("too many connections from this account"), None),
            HandshakeRejectionClass::TooManyConnections
        );
    }

    #[test]
    fn no_signal_is_unknown() {
        assert_eq!(classify_handshake_rejection(None, None, None), HandshakeRejectionClass::Unknown);
        assert_eq!(
            classify_handshake_rejection(None, Some("server hiccup"), None),
            HandshakeRejectionClass::Unknown
        );
    }
}
