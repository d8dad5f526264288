//! Channel handshake and connection lifecycle (C3 + C4).
//!
//! Six ordered pre-upgrade checks — per-IP connect rate, bearer verification,
//! denylist, per-room cap, per-user cap, then accept — followed by a
//! register/serve/cleanup loop once the socket is live. Shaped after the
//! original `handle_connection`'s phase structure (handshake, then message
//! loop, then cleanup) but replacing its generic hello/auth/scopes pipeline
//! with the chat-specific one.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use moltis_protocol::{UserIdentity, WS_MAX_INBOUND_MESSAGE_BYTES};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    chat_state::ChatState, error_response::HandshakeFailure, heartbeat::Heartbeat,
    rate_limit::RateDecision, room::SocketEvent,
};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// Messages the per-connection write task understands. A superset of
/// [`SocketEvent`]: it also carries the heartbeat's own liveness pings,
/// multiplexed onto the same outbound channel.
enum Outbound {
    Text(String),
    Ping,
    Pong(bytes::Bytes),
    Close(u16, String),
}

/// Axum handler for `GET /ws`.
pub async fn upgrade(
    State(state): State<Arc<ChatState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match authorize(&state, remote_addr, &headers, &query).await {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(socket, state, user)),
        Err(failure) => {
            debug!(?failure, remote_ip = %remote_addr.ip(), "ws: handshake rejected");
            failure.into_response()
        },
    }
}

fn bearer_token(headers: &HeaderMap, query: &ConnectQuery) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
        && let Some(token) = text.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    query.token.clone()
}

async fn authorize(
    state: &Arc<ChatState>,
    remote_addr: SocketAddr,
    headers: &HeaderMap,
    query: &ConnectQuery,
) -> Result<UserIdentity, HandshakeFailure> {
    // 1. Per-IP connect-rate.
    let ip = remote_addr.ip().to_string();
    if let RateDecision::Denied { retry_after_ms } = state.connect_rate.lock().await.check(ip) {
        return Err(HandshakeFailure::RateLimited { retry_after_ms });
    }

    // 2. Bearer session token: HMAC verify + expiry.
    let token = bearer_token(headers, query).ok_or(HandshakeFailure::Unauthorized)?;
    let user = state
        .session_issuer
        .verify(&token)
        .map_err(|_| HandshakeFailure::Unauthorized)?;

    // 3. Denylist: operator-level (config) union room-level (moderator action).
    if state.operator_denylist.contains(user.account_id.as_str())
        || state.room.is_denied(user.account_id.as_str().to_string()).await
    {
        return Err(HandshakeFailure::Forbidden);
    }

    // 4. Room-wide connection cap.
    if let Some(cap) = state.max_connections_per_room
        && state.tracker.total().await >= cap
    {
        return Err(HandshakeFailure::RoomFull);
    }

    // 5. Per-user connection cap.
    if state.tracker.count_for(user.account_id.as_str()).await >= state.max_connections_per_user {
        return Err(HandshakeFailure::TooManyConnections);
    }

    Ok(user)
}

/// 6. Accept, then register/serve/cleanup.
async fn handle_socket(socket: WebSocket, state: Arc<ChatState>, user: UserIdentity) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let account_id = user.account_id.as_str().to_string();
    info!(conn_id = %conn_id, account_id = %account_id, "ws: connection accepted");

    state.tracker.acquire(&account_id).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let sent = match outbound {
                Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
                Outbound::Pong(payload) => ws_tx.send(Message::Pong(payload)).await,
                Outbound::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
            };
            if sent.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<SocketEvent>();
    let forward_out_tx = out_tx.clone();
    let forward_handle = tokio::spawn(async move {
        while let Some(event) = socket_rx.recv().await {
            let outbound = match event {
                SocketEvent::Frame(text) => Outbound::Text(text),
                SocketEvent::Close { code, reason } => Outbound::Close(code, reason),
            };
            if forward_out_tx.send(outbound).is_err() {
                break;
            }
        }
    });

    let Some(ack) = state.room.connect(conn_id.clone(), user.clone(), socket_tx).await else {
        warn!(conn_id = %conn_id, "ws: room actor unavailable");
        let _ = out_tx.send(Outbound::Close(1011, "internal error".into()));
        drop(out_tx);
        write_handle.abort();
        forward_handle.abort();
        state.tracker.release(&account_id).await;
        return;
    };

    if let Ok(json) = moltis_protocol::encode_server_frame(ack.welcome) {
        let _ = out_tx.send(Outbound::Text(json));
    }
    if let Some(snapshot) = ack.moderation_snapshot
        && let Ok(json) = moltis_protocol::encode_server_frame(snapshot)
    {
        let _ = out_tx.send(Outbound::Text(json));
    }

    let heartbeat = {
        let ping_tx = out_tx.clone();
        let timeout_room = state.room.clone();
        let timeout_tx = out_tx.clone();
        let timeout_conn_id = conn_id.clone();
        Heartbeat::spawn(
            conn_id.clone(),
            state.ping_interval,
            state.pong_timeout,
            move || {
                let _ = ping_tx.send(Outbound::Ping);
            },
            move || {
                let _ = timeout_tx.send(Outbound::Close(1001, "ping timeout".into()));
                timeout_room.disconnect(timeout_conn_id);
            },
        )
    };

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };
        match message {
            Message::Text(text) => {
                if text.len() > WS_MAX_INBOUND_MESSAGE_BYTES {
                    let _ = out_tx.send(Outbound::Close(1009, "message too large".into()));
                    break;
                }
                match moltis_protocol::decode_client_frame(&text) {
                    Some(frame) => state.room.submit(conn_id.clone(), frame),
                    None => state.room.submit_invalid(conn_id.clone()),
                }
            },
            Message::Binary(bytes) => {
                if bytes.len() > WS_MAX_INBOUND_MESSAGE_BYTES {
                    let _ = out_tx.send(Outbound::Close(1009, "message too large".into()));
                    break;
                }
                state.room.submit_invalid(conn_id.clone());
            },
            Message::Pong(_) => heartbeat.on_pong(),
            Message::Ping(payload) => {
                let _ = out_tx.send(Outbound::Pong(payload));
            },
            Message::Close(_) => break,
        }
    }

    heartbeat.stop();
    state.room.disconnect(conn_id.clone());
    state.tracker.release(&account_id).await;
    drop(out_tx);
    write_handle.abort();
    forward_handle.abort();
    debug!(conn_id = %conn_id, "ws: connection closed");
}
