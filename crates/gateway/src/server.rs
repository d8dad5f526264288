//! HTTP/WebSocket surface: health check, session exchange, telemetry sink,
//! and the `/ws` upgrade. Mirrors the original gateway's layered-middleware
//! + `TcpListener`/`axum::serve` startup shape, generalized down to the four
//! routes the chat service actually exposes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use moltis_auth::SessionIssuer;
use moltis_config::ChatConfig;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveHeadersLayer,
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info, warn};

use crate::{
    chat_state::ChatState,
    error_response::ExchangeError,
    rate_limit::{RateDecision, RateLimitStore},
    room::{self, RoomConfig},
    room::storage::{FileRoomStorage, RoomStorage},
};

/// `/telemetry` body limit — small, client-reported diagnostics only.
const TELEMETRY_BODY_LIMIT: usize = 4 * 1024;
/// `/auth/exchange` body limit.
const EXCHANGE_BODY_LIMIT: usize = 2 * 1024;

/// Builds the full router: middleware stack wrapped around the four routes.
pub fn build_app(state: Arc<ChatState>) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/auth/exchange", post(exchange_handler))
        .route("/telemetry", post(telemetry_handler))
        .route("/ws", get(crate::ws::upgrade))
        .with_state(state);

    apply_middleware_stack(router)
}

/// Layer order (outermost → innermost for requests): panic catch, sensitive
/// header marking, request ID generation, trace, CORS, response security
/// headers, request ID propagation, compression.
fn apply_middleware_stack(router: Router) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let router = router
        .layer(CompressionLayer::new())
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("deny"),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(cors);

    let http_trace = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_owned();
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id
            )
        })
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    router
        .layer(http_trace)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        .layer(CatchPanicLayer::new())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    access_token: String,
}

/// `POST /auth/exchange` (C2): trades an identity-provider access token for a
/// session ticket. The body read is both size-bounded (reject with 413
/// before parsing on `Content-Length` overshoot, or mid-stream for chunked
/// bodies) and time-bounded to 1s, per the session-exchange read contract.
async fn exchange_handler(
    State(state): State<Arc<ChatState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
) -> impl IntoResponse {
    if let Some(len) = content_length(&headers)
        && len > EXCHANGE_BODY_LIMIT
    {
        return ExchangeError::PayloadTooLarge.into_response();
    }

    let body = match tokio::time::timeout(
        Duration::from_secs(1),
        to_bytes(request.into_body(), EXCHANGE_BODY_LIMIT),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => return ExchangeError::PayloadTooLarge.into_response(),
        Err(_) => return ExchangeError::InvalidJson.into_response(),
    };

    let ip = remote_addr.ip().to_string();
    if let RateDecision::Denied { retry_after_ms } = state.exchange_rate.lock().await.check(ip) {
        return ExchangeError::RateLimited { retry_after_ms }.into_response();
    }

    let request: ExchangeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => return ExchangeError::InvalidJson.into_response(),
    };
    if request.access_token.trim().is_empty() {
        return ExchangeError::InvalidPayload("access_token must not be empty".into())
            .into_response();
    }

    match state
        .session_issuer
        .exchange(&Secret::new(request.access_token))
        .await
    {
        Ok(ticket) => {
            let mut response = Json(ticket).into_response();
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        },
        Err(e) => {
            warn!(error = %e, "auth exchange failed");
            ExchangeError::AuthFailed.into_response()
        },
    }
}

/// `POST /telemetry`: accepts opaque client-reported diagnostics, bounded and
/// rate limited, never persisted beyond the log line.
async fn telemetry_handler(
    State(state): State<Arc<ChatState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if body.len() > TELEMETRY_BODY_LIMIT {
        return StatusCode::PAYLOAD_TOO_LARGE;
    }
    let ip = remote_addr.ip().to_string();
    if let RateDecision::Denied { .. } = state.connect_rate.lock().await.check(format!("telemetry:{ip}")) {
        return StatusCode::TOO_MANY_REQUESTS;
    }
    match std::str::from_utf8(&body) {
        Ok(text) => info!(remote_ip = %ip, telemetry = %text, "client telemetry"),
        Err(_) => return StatusCode::BAD_REQUEST,
    }
    StatusCode::NO_CONTENT
}

/// Assembles the room actor and `ChatState`, binds the listener, and serves
/// until the process is killed.
pub async fn start(config: ChatConfig) -> anyhow::Result<()> {
    let data_dir = config
        .data_dir
        .clone()
        .map(std::path::PathBuf::from)
        .or_else(moltis_config::data_dir)
        .unwrap_or_else(|| std::path::PathBuf::from(".moltis-chat"));
    let snapshot_path = data_dir.join("room.json");

    let storage: Box<dyn RoomStorage> = Box::new(FileRoomStorage::new(snapshot_path));
    let room = room::spawn(
        RoomConfig {
            history_limit: config.history_limit,
            history_persist_every_n: config.history_persist_every_n_messages,
            message_rate_window: Duration::from_millis(config.message_rate_window_ms),
            message_rate_max_count: config.message_rate_max_count,
            operator_denylist: config.deny_account_ids.clone(),
        },
        storage,
    );

    let secret = config
        .session_secret_str()
        .ok_or_else(|| anyhow::anyhow!("SESSION_SECRET is required"))?
        .to_string();
    let session_issuer = SessionIssuer::new(
        config.github_api_base_url.clone(),
        Secret::new(secret),
        config.session_ttl_ms,
        config.moderator_account_ids.clone(),
    );

    let state = ChatState::new(
        session_issuer,
        room,
        Duration::from_millis(config.connect_rate_window_ms),
        config.connect_rate_max_count,
        config.deny_account_ids.clone(),
        config.max_connections_per_user,
        config.max_connections_per_room.map(|n| n as usize),
        Duration::from_millis(config.ping_interval_ms),
        Duration::from_millis(config.pong_timeout_ms),
    );

    let app = build_app(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid CHAT_BIND_ADDR {:?}: {e}", config.bind_addr))?;
    if config.is_loopback_bind() {
        info!(bind = %addr, "binding to a loopback address; reachable only from this host");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind = %addr, "chat server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
