//! Chat room actor (C6): single-writer owner of `RoomState`, fed by an mpsc
//! channel. The single-writer invariant is structural — only this module's
//! `run` loop ever touches `RoomState` — generalizing the existing
//! `GatewayState` pattern (`Arc<RwLock<HashMap<...>>>` shared across many
//! request tasks) to an owned-by-one-task model.

pub mod dm;
pub mod storage;

use std::{collections::HashMap, time::Duration};

use moltis_protocol::{
    AccountId, CiphertextFrame, ClientFrame, ErrorBody, PairId, PlainFrame, PresenceEntry,
    PublicIdentity, ServerFrame, UserIdentity, WS_MAX_CONSECUTIVE_INVALID_PAYLOADS, WireErrorCode,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::rate_limit::{RateDecision, RateLimitStore};
use dm::DmRoom;
use storage::{RoomSnapshot, RoomStorage};

const PRESENCE_DEBOUNCE: Duration = Duration::from_millis(100);

/// What the owning connection's write-loop should do with an actor decision.
pub enum SocketEvent {
    Frame(String),
    Close { code: u16, reason: String },
}

struct Socket {
    user: UserIdentity,
    sender: mpsc::UnboundedSender<SocketEvent>,
    invalid_strikes: u32,
}

/// Configuration fixed at room construction, not mutated afterward.
pub struct RoomConfig {
    pub history_limit: usize,
    pub history_persist_every_n: u32,
    pub message_rate_window: Duration,
    pub message_rate_max_count: u32,
    pub operator_denylist: std::collections::HashSet<String>,
}

/// Everything the actor owns. Never touched outside `run`.
struct RoomState {
    config: RoomConfig,
    storage: Box<dyn RoomStorage>,
    history: std::collections::VecDeque<PlainFrame>,
    pending_persist: u32,
    room_denylist: std::collections::HashSet<String>,
    dm_identities: HashMap<String, PublicIdentity>,
    dm_rooms: HashMap<String, DmRoom>,
    sockets: HashMap<String, Socket>,
    message_rate: RateLimitStore<String>,
    presence_flush_scheduled: bool,
    self_tx: mpsc::UnboundedSender<RoomMessage>,
}

/// Messages the actor accepts, one at a time, in arrival order.
pub enum RoomMessage {
    Connect {
        conn_id: String,
        user: UserIdentity,
        sender: mpsc::UnboundedSender<SocketEvent>,
        reply: oneshot::Sender<ConnectAck>,
    },
    Disconnect {
        conn_id: String,
    },
    Frame {
        conn_id: String,
        frame: Box<ClientFrame>,
    },
    InvalidFrame {
        conn_id: String,
    },
    IsDenied {
        account_id: String,
        reply: oneshot::Sender<bool>,
    },
    FlushPresence,
}

pub struct ConnectAck {
    pub welcome: ServerFrame,
    pub moderation_snapshot: Option<ServerFrame>,
}

/// A cheap-to-clone handle the connection layer uses to talk to the actor.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomMessage>,
}

impl RoomHandle {
    pub async fn connect(
        &self,
        conn_id: String,
        user: UserIdentity,
        sender: mpsc::UnboundedSender<SocketEvent>,
    ) -> Option<ConnectAck> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomMessage::Connect { conn_id, user, sender, reply }).ok()?;
        rx.await.ok()
    }

    pub fn disconnect(&self, conn_id: String) {
        let _ = self.tx.send(RoomMessage::Disconnect { conn_id });
    }

    pub fn submit(&self, conn_id: String, frame: ClientFrame) {
        let _ = self.tx.send(RoomMessage::Frame { conn_id, frame: Box::new(frame) });
    }

    pub fn submit_invalid(&self, conn_id: String) {
        let _ = self.tx.send(RoomMessage::InvalidFrame { conn_id });
    }

    /// Checks the room's moderator-driven denylist (not the operator-level
    /// one, which the handshake layer checks itself from config).
    pub async fn is_denied(&self, account_id: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomMessage::IsDenied { account_id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Spawns the room actor task and returns a handle to it.
pub fn spawn(config: RoomConfig, storage: Box<dyn RoomStorage>) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let message_rate =
        RateLimitStore::new(config.message_rate_window, config.message_rate_max_count, 4096);
    let state = RoomState {
        config,
        storage,
        history: std::collections::VecDeque::new(),
        pending_persist: 0,
        room_denylist: std::collections::HashSet::new(),
        dm_identities: HashMap::new(),
        dm_rooms: HashMap::new(),
        sockets: HashMap::new(),
        message_rate,
        presence_flush_scheduled: false,
        self_tx: tx.clone(),
    };
    tokio::spawn(state.run(rx));
    RoomHandle { tx }
}

impl RoomState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomMessage>) {
        let snapshot = match self.storage.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to load room snapshot, starting empty");
                RoomSnapshot::default()
            },
        };
        self.history = snapshot.history.into();
        self.truncate_history();
        self.room_denylist = snapshot.room_denylist;
        self.dm_identities = snapshot.dm_identities;
        for (pair_id, history) in snapshot.dm_histories {
            self.dm_rooms.insert(pair_id, DmRoom::from_snapshot(history, self.config.history_limit));
        }

        while let Some(msg) = rx.recv().await {
            match msg {
                RoomMessage::Connect { conn_id, user, sender, reply } => {
                    self.handle_connect(conn_id, user, sender, reply).await;
                },
                RoomMessage::Disconnect { conn_id } => self.handle_disconnect(conn_id).await,
                RoomMessage::Frame { conn_id, frame } => self.handle_frame(conn_id, *frame).await,
                RoomMessage::InvalidFrame { conn_id } => self.handle_invalid(conn_id).await,
                RoomMessage::IsDenied { account_id, reply } => {
                    let _ = reply.send(self.room_denylist.contains(&account_id));
                },
                RoomMessage::FlushPresence => self.flush_presence().await,
            }
        }
    }

    async fn handle_connect(
        &mut self,
        conn_id: String,
        user: UserIdentity,
        sender: mpsc::UnboundedSender<SocketEvent>,
        reply: oneshot::Sender<ConnectAck>,
    ) {
        let welcome = ServerFrame::Welcome {
            user: user.clone(),
            server_time: now_iso8601(),
            history: self.history.iter().cloned().collect(),
        };
        let moderation_snapshot = user
            .is_moderator()
            .then(|| ServerFrame::ModerationSnapshot { denylist: self.room_denylist.iter().cloned().collect() });

        self.sockets.insert(conn_id, Socket { user, sender, invalid_strikes: 0 });
        let _ = reply.send(ConnectAck { welcome, moderation_snapshot });
        self.schedule_presence_flush();
    }

    async fn handle_disconnect(&mut self, conn_id: String) {
        if self.sockets.remove(&conn_id).is_some() {
            self.schedule_presence_flush();
        }
    }

    async fn handle_invalid(&mut self, conn_id: String) {
        let Some(socket) = self.sockets.get_mut(&conn_id) else { return };
        socket.invalid_strikes += 1;
        if socket.invalid_strikes >= WS_MAX_CONSECUTIVE_INVALID_PAYLOADS {
            self.close_socket(&conn_id, 1008, "too many invalid payloads");
        } else {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
        }
    }

    async fn handle_frame(&mut self, conn_id: String, frame: ClientFrame) {
        if let Some(socket) = self.sockets.get_mut(&conn_id) {
            socket.invalid_strikes = 0;
        } else {
            return;
        }

        match frame {
            ClientFrame::Hello => {},
            ClientFrame::MessageSend { text, client_message_id } => {
                self.handle_message_send(conn_id, text, client_message_id).await;
            },
            ClientFrame::DmIdentityPublish { identity } => {
                self.handle_dm_identity_publish(conn_id, identity).await;
            },
            ClientFrame::DmOpen { target_account_id } => {
                self.handle_dm_open(conn_id, target_account_id).await;
            },
            ClientFrame::DmMessageSend {
                pair_id,
                recipient_account_id,
                sender_identity,
                recipient_identity,
                nonce,
                ciphertext,
            } => {
                self.handle_dm_message_send(
                    conn_id,
                    pair_id,
                    recipient_account_id,
                    sender_identity,
                    recipient_identity,
                    nonce,
                    ciphertext,
                )
                .await;
            },
            ClientFrame::ModerationUserDeny { target_account_id, reason } => {
                self.handle_moderation_deny(conn_id, target_account_id, reason).await;
            },
            ClientFrame::ModerationUserAllow { target_account_id } => {
                self.handle_moderation_allow(conn_id, target_account_id).await;
            },
        }
    }

    async fn handle_message_send(
        &mut self,
        conn_id: String,
        text: String,
        client_message_id: Option<String>,
    ) {
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        let text = match moltis_protocol::MessageText::parse(text) {
            Ok(t) => t,
            Err(_) => {
                self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, client_message_id);
                return;
            },
        };

        if let RateDecision::Denied { retry_after_ms } =
            self.message_rate.check(account_id.as_str().to_string())
        {
            self.send_error(
                &conn_id,
                WireErrorCode::RateLimited,
                Some(retry_after_ms),
                client_message_id,
            );
            return;
        }

        let Some(user) = self.sockets.get(&conn_id).map(|s| s.user.clone()) else { return };
        let message = PlainFrame {
            id: uuid::Uuid::new_v4().to_string(),
            user,
            text: text.as_str().to_string(),
            created_at: now_iso8601(),
        };
        self.history.push_back(message.clone());
        self.truncate_history();
        self.persist_if_due().await;

        self.broadcast_all(ServerFrame::MessageNew { message: message.clone(), client_message_id: None });
        if let Some(client_message_id) = client_message_id {
            self.send_frame(
                &conn_id,
                ServerFrame::MessageNew { message, client_message_id: Some(client_message_id) },
            );
        }
    }

    async fn handle_dm_identity_publish(&mut self, conn_id: String, identity: PublicIdentity) {
        if identity.validate().is_err() {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        }
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        self.dm_identities.insert(account_id.as_str().to_string(), identity);
        self.persist_snapshot().await;
    }

    async fn handle_dm_open(&mut self, conn_id: String, target_account_id: String) {
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        let Ok(target) = AccountId::parse(target_account_id.clone()) else {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        };
        if target == account_id {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        }

        let pair_id = PairId::of(&account_id, &target);
        let history = self
            .dm_rooms
            .entry(pair_id.as_str().to_string())
            .or_insert_with(|| DmRoom::new(self.config.history_limit))
            .history();
        let peer_identity = self.dm_identities.get(target.as_str()).cloned();

        self.send_frame(
            &conn_id,
            ServerFrame::DmWelcome {
                pair_id: pair_id.as_str().to_string(),
                peer_account_id: target.as_str().to_string(),
                peer_identity,
                history,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_dm_message_send(
        &mut self,
        conn_id: String,
        pair_id: String,
        recipient_account_id: String,
        sender_identity: PublicIdentity,
        recipient_identity: PublicIdentity,
        nonce: String,
        ciphertext: String,
    ) {
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        let Ok(parsed_pair) = PairId::parse(pair_id.clone()) else {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        };
        let Ok(recipient) = AccountId::parse(recipient_account_id.clone()) else {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        };
        if parsed_pair != PairId::of(&account_id, &recipient) {
            self.send_error(&conn_id, WireErrorCode::Forbidden, None, None);
            return;
        }

        if let RateDecision::Denied { retry_after_ms } =
            self.message_rate.check(account_id.as_str().to_string())
        {
            self.send_error(&conn_id, WireErrorCode::RateLimited, Some(retry_after_ms), None);
            return;
        }

        let Some(sender_user) = self.sockets.get(&conn_id).map(|s| s.user.clone()) else { return };
        let frame = CiphertextFrame {
            id: uuid::Uuid::new_v4().to_string(),
            pair_id: pair_id.clone(),
            sender: sender_user,
            recipient_account_id: recipient_account_id.clone(),
            sender_identity,
            recipient_identity,
            nonce,
            ciphertext,
            created_at: now_iso8601(),
        };
        if frame.validate().is_err() {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        }

        let persist_every_n = self.config.history_persist_every_n;
        let needs_persist = self
            .dm_rooms
            .entry(pair_id)
            .or_insert_with(|| DmRoom::new(self.config.history_limit))
            .append(frame.clone(), persist_every_n);
        if needs_persist {
            self.persist_snapshot().await;
        }

        let recipient_str = recipient.as_str().to_string();
        let sender_str = account_id.as_str().to_string();
        self.broadcast_to(
            |s| {
                let id = s.user.account_id.as_str();
                id == sender_str || id == recipient_str
            },
            ServerFrame::DmMessageNew { message: frame },
        );
    }

    async fn handle_moderation_deny(
        &mut self,
        conn_id: String,
        target_account_id: String,
        _reason: Option<String>,
    ) {
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        if !self.is_moderator(&conn_id) {
            self.send_error(&conn_id, WireErrorCode::Forbidden, None, None);
            return;
        }
        if target_account_id == account_id.as_str() {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        }

        self.room_denylist.insert(target_account_id.clone());
        self.persist_snapshot().await;

        let targets: Vec<String> = self
            .sockets
            .iter()
            .filter(|(_, s)| s.user.account_id.as_str() == target_account_id)
            .map(|(id, _)| id.clone())
            .collect();
        for target_conn in targets {
            self.send_error(&target_conn, WireErrorCode::Forbidden, None, None);
            self.close_socket(&target_conn, 1008, "banned");
        }

        self.broadcast_to_moderators(ServerFrame::ModerationUserDenied {
            actor: account_id.as_str().to_string(),
            target: target_account_id,
        });
    }

    async fn handle_moderation_allow(&mut self, conn_id: String, target_account_id: String) {
        let Some(account_id) = self.account_id_of(&conn_id) else { return };
        if !self.is_moderator(&conn_id) {
            self.send_error(&conn_id, WireErrorCode::Forbidden, None, None);
            return;
        }
        if target_account_id == account_id.as_str() {
            self.send_error(&conn_id, WireErrorCode::InvalidPayload, None, None);
            return;
        }
        if self.config.operator_denylist.contains(&target_account_id) {
            self.send_error(&conn_id, WireErrorCode::Forbidden, None, None);
            return;
        }

        self.room_denylist.remove(&target_account_id);
        self.persist_snapshot().await;

        self.broadcast_to_moderators(ServerFrame::ModerationUserAllowed {
            actor: account_id.as_str().to_string(),
            target: target_account_id,
        });
    }

    fn account_id_of(&self, conn_id: &str) -> Option<AccountId> {
        self.sockets.get(conn_id).map(|s| s.user.account_id.clone())
    }

    fn is_moderator(&self, conn_id: &str) -> bool {
        self.sockets.get(conn_id).is_some_and(|s| s.user.is_moderator())
    }

    fn send_frame(&self, conn_id: &str, frame: ServerFrame) {
        let Some(socket) = self.sockets.get(conn_id) else { return };
        let Ok(json) = moltis_protocol::encode_server_frame(frame) else { return };
        let _ = socket.sender.send(SocketEvent::Frame(json));
    }

    fn send_error(
        &self,
        conn_id: &str,
        code: WireErrorCode,
        retry_after_ms: Option<u64>,
        client_message_id: Option<String>,
    ) {
        self.send_frame(
            conn_id,
            ServerFrame::Error(ErrorBody { code, message: None, retry_after_ms, client_message_id }),
        );
    }

    fn close_socket(&mut self, conn_id: &str, code: u16, reason: &str) {
        if let Some(socket) = self.sockets.remove(conn_id) {
            let _ = socket.sender.send(SocketEvent::Close { code, reason: reason.to_string() });
            self.schedule_presence_flush();
        }
    }

    fn broadcast_all(&self, frame: ServerFrame) {
        self.broadcast_to(|_| true, frame);
    }

    fn broadcast_to_moderators(&self, frame: ServerFrame) {
        self.broadcast_to(|s| s.user.is_moderator(), frame);
    }

    fn broadcast_to(&self, predicate: impl Fn(&Socket) -> bool, frame: ServerFrame) {
        let Ok(json) = moltis_protocol::encode_server_frame(frame) else { return };
        for socket in self.sockets.values().filter(|s| predicate(s)) {
            let _ = socket.sender.send(SocketEvent::Frame(json.clone()));
        }
    }

    fn truncate_history(&mut self) {
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    async fn persist_if_due(&mut self) {
        self.pending_persist += 1;
        if self.pending_persist >= self.config.history_persist_every_n.max(1) {
            self.pending_persist = 0;
            self.persist_snapshot().await;
        }
    }

    async fn persist_snapshot(&mut self) {
        let snapshot = RoomSnapshot {
            history: self.history.iter().cloned().collect(),
            room_denylist: self.room_denylist.clone(),
            dm_identities: self.dm_identities.clone(),
            dm_histories: self.dm_rooms.iter().map(|(k, v)| (k.clone(), v.history())).collect(),
        };
        if let Err(e) = self.storage.save(snapshot).await {
            warn!(error = %e, "failed to persist room snapshot");
        }
    }

    fn schedule_presence_flush(&mut self) {
        if self.presence_flush_scheduled {
            return;
        }
        self.presence_flush_scheduled = true;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PRESENCE_DEBOUNCE).await;
            let _ = tx.send(RoomMessage::FlushPresence);
        });
    }

    async fn flush_presence(&mut self) {
        self.presence_flush_scheduled = false;
        let mut counts: HashMap<(String, String), u32> = HashMap::new();
        for socket in self.sockets.values() {
            let key = (socket.user.login.clone(), socket.user.account_id.as_str().to_string());
            *counts.entry(key).or_insert(0) += 1;
        }
        let mut snapshot: Vec<PresenceEntry> = counts
            .into_iter()
            .map(|((login, account_id), connections)| PresenceEntry { account_id, login, connections })
            .collect();
        snapshot.sort_by(|a, b| (&a.login, &a.account_id).cmp(&(&b.login, &b.account_id)));
        debug!(accounts = snapshot.len(), "presence snapshot");
        self.broadcast_all(ServerFrame::Presence { snapshot });
    }
}

/// Current instant, ISO-8601 (RFC 3339) formatted, as every `createdAt` and
/// `serverTime` field on the wire is specified to be.
fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}
