//! HTTP-facing error taxonomy (C12) for the session-exchange and
//! channel-handshake endpoints.
//!
//! Channel frame errors use [`moltis_protocol::ErrorBody`] directly; this
//! module covers the two places an error must become an HTTP response: the
//! `/auth/exchange` endpoint (C2) and the pre-upgrade handshake (C3).

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use moltis_protocol::{HandshakeRejection, HandshakeRejectionCode};

/// Errors `/auth/exchange` can return.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("request body is not valid JSON")]
    InvalidJson,
    #[error("request payload failed validation: {0}")]
    InvalidPayload(String),
    #[error("identity provider rejected the access token")]
    AuthFailed,
    #[error("request body exceeds the size limit")]
    PayloadTooLarge,
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidJson => (StatusCode::BAD_REQUEST, "invalid_json"),
            Self::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            Self::AuthFailed => (StatusCode::UNAUTHORIZED, "auth_failed"),
            Self::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            Self::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        };
        let mut response = (
            status,
            Json(serde_json::json!({ "code": code, "message": self.to_string() })),
        )
            .into_response();
        if let Self::RateLimited { retry_after_ms } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response.headers_mut().insert(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        response
    }
}

/// The six ordered pre-upgrade checks in C3 each produce one of these.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeFailure {
    RateLimited { retry_after_ms: u64 },
    Unauthorized,
    Forbidden,
    RoomFull,
    TooManyConnections,
}

impl IntoResponse for HandshakeFailure {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "session token invalid or expired").into_response()
            },
            Self::Forbidden => (StatusCode::FORBIDDEN, "account is denied").into_response(),
            Self::RateLimited { retry_after_ms } => rejection_response(
                StatusCode::TOO_MANY_REQUESTS,
                HandshakeRejectionCode::RateLimited,
                retry_after_ms,
            ),
            Self::RoomFull => rejection_response(
                StatusCode::TOO_MANY_REQUESTS,
                HandshakeRejectionCode::RoomFull,
                0,
            ),
            Self::TooManyConnections => rejection_response(
                StatusCode::TOO_MANY_REQUESTS,
                HandshakeRejectionCode::TooManyConnections,
                0,
            ),
        }
    }
}

fn rejection_response(
    status: StatusCode,
    code: HandshakeRejectionCode,
    retry_after_ms: u64,
) -> Response {
    let body = HandshakeRejection {
        code,
        message: None,
        retry_after_ms: (retry_after_ms > 0).then_some(retry_after_ms),
    };
    let mut response = (status, Json(body)).into_response();
    if retry_after_ms > 0 {
        let secs = retry_after_ms.div_ceil(1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = HandshakeFailure::RateLimited { retry_after_ms: 2_500 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn exchange_rate_limited_is_no_store() {
        let response = ExchangeError::RateLimited { retry_after_ms: 1_000 }.into_response();
        assert_eq!(
            response.headers().get(axum::http::header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }
}
