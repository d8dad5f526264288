//! A concrete [`Effects`] implementation wiring the reducer's commands to
//! real network I/O: the session-exchange HTTP call over `reqwest`, and the
//! channel handshake plus frame loop over `tokio-tungstenite` — the same two
//! crates the rest of this workspace already uses for outbound HTTP and the
//! chat channel's wire transport.
//!
//! The identity-provider OAuth flow itself is an external collaborator:
//! [`IdentityProvider`] is the seam the host application fills in; this
//! module only consumes its result.

use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use moltis_protocol::{ClientFrame, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{
    self, Message as WsMessage,
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};
use tracing::{debug, info, warn};

use crate::{
    event::{ChannelOpenErrorKind, Event, ExchangeErrorKind, ExchangeOk, IdentitySession},
    runtime::{Effects, Runtime},
};

/// The result of the host's identity-provider round trip (sign-in /
/// silent-refresh). Implemented by the host application, not this crate.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_identity(&self, interactive: bool, clear_pref: bool) -> IdentityOutcome;
}

/// What [`IdentityProvider::get_identity`] reports back to the reducer.
pub struct IdentityOutcome {
    pub ok: bool,
    pub session: Option<IdentitySession>,
    pub error: Option<String>,
    pub now_ms: u64,
}

/// Frames the reducer doesn't itself consume (`message.new`, `presence`,
/// DM frames, moderation frames, errors) are handed to this callback for
/// the host UI to render. `welcome` is translated into `channel.welcome`
/// and fed back into the reducer instead of reaching here.
pub type FrameSubscriber = Arc<dyn Fn(ServerFrame) + Send + Sync>;
/// Sink for `raise` commands: user-facing errors, surfaced only on
/// `origin: user` failure paths.
pub type ErrorSink = Arc<dyn Fn(String, Option<&'static str>) + Send + Sync>;

struct OpenChannel {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: tokio::task::JoinHandle<()>,
    /// Set before an intentional close so the reader loop's terminal
    /// `channel.closed` dispatch reports `autoReconnectEnabled: false`.
    suppress_reconnect: Arc<AtomicBool>,
}

/// Concrete [`Effects`]: real HTTP exchange, real websocket channel,
/// `tracing`-based telemetry, and a host-supplied error sink.
pub struct HttpEffects<I> {
    http: reqwest::Client,
    identity: Arc<I>,
    subscriber: FrameSubscriber,
    on_error: ErrorSink,
    runtime: OnceLock<Weak<Runtime<Self>>>,
    channel: Mutex<Option<OpenChannel>>,
    reconnect_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<I: IdentityProvider + 'static> HttpEffects<I> {
    pub fn new(identity: Arc<I>, subscriber: FrameSubscriber, on_error: ErrorSink) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            identity,
            subscriber,
            on_error,
            runtime: OnceLock::new(),
            channel: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
        })
    }

    /// Must be called once, immediately after constructing the owning
    /// [`Runtime`], so command execution can dispatch events back into it.
    /// Held as a `Weak` reference: `Runtime` owns an `Arc<Self>`, so a
    /// strong back-reference here would leak both forever.
    pub fn attach(self: &Arc<Self>, runtime: &Arc<Runtime<Self>>) {
        let _ = self.runtime.set(Arc::downgrade(runtime));
    }

    fn runtime(&self) -> Option<Arc<Runtime<Self>>> {
        self.runtime.get().and_then(Weak::upgrade)
    }

    /// Closes any currently-open channel, suppressing its reconnect-closed
    /// dispatch so the caller's own open/close sequencing doesn't also
    /// trigger an unwanted reconnect. `code`/`reason` are logged but not
    /// sent on the wire — a bare best-effort `Message::Close(None)`.
    async fn close_current_channel(&self, code: u16, reason: &str) {
        let existing = self.channel.lock().await.take();
        if let Some(existing) = existing {
            debug!(code, reason, "channel: closing");
            existing.suppress_reconnect.store(true, Ordering::SeqCst);
            let _ = existing.outbound.send(WsMessage::Close(None));
            existing.reader.abort();
        }
    }
}

#[async_trait]
impl<I: IdentityProvider + 'static> Effects for HttpEffects<I> {
    async fn get_identity(&self, interactive: bool, clear_pref: bool) {
        let outcome = self.identity.get_identity(interactive, clear_pref).await;
        if let Some(runtime) = self.runtime() {
            runtime
                .dispatch(Event::IdentityResult {
                    ok: outcome.ok,
                    session: outcome.session,
                    error: outcome.error,
                    now_ms: outcome.now_ms,
                })
                .await;
        }
    }

    async fn exchange(&self, endpoint: String, access_token: String) {
        let url = format!("{}/auth/exchange", endpoint.trim_end_matches('/'));
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "accessToken": access_token }))
            .send()
            .await;

        let event = match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<ExchangeResponse>().await {
                Ok(body) => Event::ExchangeResult {
                    ok: true,
                    session: Some(ExchangeOk {
                        token: body.token,
                        expires_at_ms: body.expires_at,
                        user: body.user,
                    }),
                    error: None,
                },
                Err(e) => {
                    warn!(error = %e, "exchange: response body did not match the expected shape");
                    Event::ExchangeResult { ok: false, session: None, error: Some(ExchangeErrorKind::InvalidResponse) }
                },
            },
            Ok(resp) => {
                let status = resp.status().as_u16();
                Event::ExchangeResult { ok: false, session: None, error: Some(ExchangeErrorKind::Http { status }) }
            },
            Err(e) => {
                debug!(error = %e, "exchange: network error");
                Event::ExchangeResult { ok: false, session: None, error: Some(ExchangeErrorKind::Network) }
            },
        };

        if let Some(runtime) = self.runtime() {
            runtime.dispatch(event).await;
        }
    }

    async fn channel_open(&self, endpoint: String, token: String) {
        self.close_current_channel(1000, "reconnect").await;

        let ws_url = to_ws_url(&endpoint);
        let mut request = match ws_url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "channel_open: invalid endpoint");
                self.dispatch_open_result(false, Some(ChannelOpenErrorKind::Network)).await;
                return;
            },
        };
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _response)) => {
                let (mut write, mut read) = stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
                let suppress_reconnect = Arc::new(AtomicBool::new(false));

                tokio::spawn(async move {
                    while let Some(msg) = out_rx.recv().await {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                let Some(runtime) = self.runtime() else { return };
                let reader_runtime = Arc::clone(&runtime);
                let reader_subscriber = Arc::clone(&self.subscriber);
                let reader_out_tx = out_tx.clone();
                let reader_suppress = Arc::clone(&suppress_reconnect);
                let reader = tokio::spawn(async move {
                    loop {
                        match read.next().await {
                            Some(Ok(WsMessage::Text(text))) => {
                                match moltis_protocol::decode_server_frame(&text) {
                                    Some(ServerFrame::Welcome { user, .. }) => {
                                        reader_runtime.dispatch(Event::ChannelWelcome { user }).await;
                                    },
                                    Some(frame) => (reader_subscriber)(frame),
                                    None => debug!("channel: unparseable or unsupported-version frame"),
                                }
                            },
                            Some(Ok(WsMessage::Ping(payload))) => {
                                let _ = reader_out_tx.send(WsMessage::Pong(payload));
                            },
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {},
                            Some(Err(e)) => {
                                debug!(error = %e, "channel: read error");
                                break;
                            },
                        }
                    }
                    reader_runtime
                        .dispatch(Event::ChannelClosed {
                            auto_reconnect_enabled: !reader_suppress.load(Ordering::SeqCst),
                        })
                        .await;
                });

                *self.channel.lock().await =
                    Some(OpenChannel { outbound: out_tx.clone(), reader, suppress_reconnect });

                if let Ok(hello) = moltis_protocol::encode_client_frame(ClientFrame::Hello) {
                    let _ = out_tx.send(WsMessage::Text(hello.into()));
                }

                self.dispatch_open_result(true, None).await;
            },
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let retry_after_ms = response
                    .headers()
                    .get(tungstenite::http::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                let body_text = response
                    .body()
                    .as_ref()
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .map(str::to_string);
                let body_code = body_text
                    .as_deref()
                    .and_then(|t| serde_json::from_str::<moltis_protocol::HandshakeRejection>(t).ok())
                    .map(|r| format!("{:?}", r.code).to_lowercase());
                self.dispatch_open_result(
                    false,
                    Some(ChannelOpenErrorKind::HandshakeHttp { status, retry_after_ms, body_code, body_text }),
                )
                .await;
            },
            Err(e) => {
                debug!(error = %e, "channel_open: network error");
                self.dispatch_open_result(false, Some(ChannelOpenErrorKind::Network)).await;
            },
        }
    }

    async fn channel_close(&self, code: u16, reason: String) {
        self.close_current_channel(code, &reason).await;
    }

    async fn reconnect_cancel(&self) {
        if let Some(handle) = self.reconnect_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn reconnect_schedule(&self, delay_ms: u64, fire: Box<dyn FnOnce() + Send>) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            fire();
        });
        if let Some(previous) = self.reconnect_timer.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn telemetry(&self, event: &'static str, fields: serde_json::Value) {
        info!(event, ?fields, "client telemetry");
    }

    async fn raise(&self, message: String, code: Option<&'static str>) {
        (self.on_error)(message, code);
    }
}

impl<I: IdentityProvider + 'static> HttpEffects<I> {
    async fn dispatch_open_result(&self, ok: bool, error: Option<ChannelOpenErrorKind>) {
        if let Some(runtime) = self.runtime() {
            runtime.dispatch(Event::ChannelOpenResult { ok, error }).await;
        }
    }
}

#[derive(serde::Deserialize)]
struct ExchangeResponse {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: u64,
    user: moltis_protocol::UserIdentity,
}

/// `http(s)://host/ws` from the configured `http(s)://host` endpoint.
fn to_ws_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else {
        format!("ws://{trimmed}/ws")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_rewrites_scheme() {
        assert_eq!(to_ws_url("http://h:8787"), "ws://h:8787/ws");
        assert_eq!(to_ws_url("https://h"), "wss://h/ws");
        assert_eq!(to_ws_url("http://h:8787/"), "ws://h:8787/ws");
    }
}
