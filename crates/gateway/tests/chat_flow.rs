//! End-to-end websocket flow against a real bound server: handshake, room
//! broadcast, moderation, and rejection on a bad bearer token.

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use moltis_auth::SessionIssuer;
use moltis_gateway::{
    chat_state::ChatState,
    room::{self, RoomConfig, storage::InMemoryRoomStorage},
    server::build_app,
};
use moltis_protocol::{AccountId, ClientFrame, ServerFrame, UserIdentity};
use secrecy::Secret;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const SECRET: &str = "test-session-secret-at-least-32-bytes-long";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn user(account_id: &str, login: &str) -> UserIdentity {
    UserIdentity {
        account_id: AccountId::parse(account_id).unwrap(),
        login: login.into(),
        avatar_url: format!("https://example.com/{login}.png"),
        roles: Vec::new(),
    }
}

/// Spins up a real `ChatState` + room actor bound to an ephemeral port, and
/// returns a second issuer sharing its signing secret so tests can mint
/// bearer tokens without a live identity-provider call.
async fn spawn_server(moderator_ids: HashSet<String>) -> (SocketAddr, SessionIssuer) {
    let storage = Box::new(InMemoryRoomStorage::default());
    let room = room::spawn(
        RoomConfig {
            history_limit: 50,
            history_persist_every_n: 20,
            message_rate_window: Duration::from_secs(1),
            message_rate_max_count: 5,
            operator_denylist: HashSet::new(),
        },
        storage,
    );
    let session_issuer = SessionIssuer::new(
        "https://api.github.com".into(),
        Secret::new(SECRET.to_string()),
        3_600_000,
        moderator_ids.clone(),
    );
    let minter =
        SessionIssuer::new("https://api.github.com".into(), Secret::new(SECRET.to_string()), 3_600_000, moderator_ids);

    let state = ChatState::new(
        session_issuer,
        room,
        Duration::from_millis(100),
        1000,
        HashSet::new(),
        10,
        None,
        Duration::from_secs(30),
        Duration::from_secs(30),
    );
    let app = build_app(state).into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, minter)
}

async fn connect(addr: SocketAddr, token: &str) -> WsStream {
    let url = format!("ws://{addr}/ws?token={token}");
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Reads the next application frame, transparently skipping the debounced
/// `presence` broadcast that can land between other frames at any time.
async fn next_frame(ws: &mut WsStream) -> ServerFrame {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let frame = moltis_protocol::decode_server_frame(&text).unwrap();
                if matches!(frame, ServerFrame::Presence { .. }) {
                    continue;
                }
                return frame;
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connect_receives_welcome_then_broadcast_message() {
    let (addr, minter) = spawn_server(HashSet::new()).await;
    let alice = minter.mint(user("1", "alice")).unwrap();
    let bob = minter.mint(user("2", "bob")).unwrap();

    let mut alice_ws = connect(addr, &alice.token).await;
    let welcome = next_frame(&mut alice_ws).await;
    assert!(matches!(welcome, ServerFrame::Welcome { history, .. } if history.is_empty()));

    let mut bob_ws = connect(addr, &bob.token).await;
    let _ = next_frame(&mut bob_ws).await; // bob's own welcome

    let send = ClientFrame::MessageSend { text: "hello room".into(), client_message_id: Some("cm-1".into()) };
    alice_ws.send(Message::Text(moltis_protocol::encode_client_frame(send).unwrap().into())).await.unwrap();

    match next_frame(&mut alice_ws).await {
        ServerFrame::MessageNew { message, client_message_id } => {
            assert_eq!(message.text, "hello room");
            assert_eq!(client_message_id.as_deref(), Some("cm-1"));
        },
        other => panic!("expected message.new, got {other:?}"),
    }

    match next_frame(&mut bob_ws).await {
        ServerFrame::MessageNew { message, client_message_id } => {
            assert_eq!(message.text, "hello room");
            assert!(client_message_id.is_none());
        },
        other => panic!("expected message.new, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_rejects_bad_bearer_token() {
    let (addr, _minter) = spawn_server(HashSet::new()).await;
    let url = format!("ws://{addr}/ws?token=garbage");
    let result = tokio_tungstenite::connect_async(url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn rate_limited_sender_gets_error_frame_only() {
    let (addr, minter) = spawn_server(HashSet::new()).await;
    let alice = minter.mint(user("1", "alice")).unwrap();
    let mut alice_ws = connect(addr, &alice.token).await;
    let _ = next_frame(&mut alice_ws).await; // welcome

    for i in 0..5 {
        let send = ClientFrame::MessageSend { text: format!("msg {i}"), client_message_id: None };
        alice_ws.send(Message::Text(moltis_protocol::encode_client_frame(send).unwrap().into())).await.unwrap();
        let _ = next_frame(&mut alice_ws).await;
    }

    let send = ClientFrame::MessageSend { text: "one too many".into(), client_message_id: None };
    alice_ws.send(Message::Text(moltis_protocol::encode_client_frame(send).unwrap().into())).await.unwrap();

    match next_frame(&mut alice_ws).await {
        ServerFrame::Error(body) => {
            assert_eq!(body.code, moltis_protocol::WireErrorCode::RateLimited);
        },
        other => panic!("expected rate-limit error, got {other:?}"),
    }
}

#[tokio::test]
async fn moderator_can_deny_a_user_and_the_target_is_disconnected() {
    let mut moderators = HashSet::new();
    moderators.insert("9".to_string());
    let (addr, minter) = spawn_server(moderators).await;
    let moderator = minter.mint(user("9", "root")).unwrap();
    let target = minter.mint(user("3", "carol")).unwrap();

    let mut mod_ws = connect(addr, &moderator.token).await;
    let _ = next_frame(&mut mod_ws).await; // welcome
    let _ = next_frame(&mut mod_ws).await; // moderation.snapshot (empty denylist)

    let mut carol_ws = connect(addr, &target.token).await;
    let _ = next_frame(&mut carol_ws).await; // welcome

    let deny = ClientFrame::ModerationUserDeny { target_account_id: "3".into(), reason: Some("spam".into()) };
    mod_ws.send(Message::Text(moltis_protocol::encode_client_frame(deny).unwrap().into())).await.unwrap();

    match next_frame(&mut mod_ws).await {
        ServerFrame::ModerationUserDenied { actor, target } => {
            assert_eq!(actor, "9");
            assert_eq!(target, "3");
        },
        other => panic!("expected moderation.user.denied, got {other:?}"),
    }

    match next_frame(&mut carol_ws).await {
        ServerFrame::Error(body) => assert_eq!(body.code, moltis_protocol::WireErrorCode::Forbidden),
        other => panic!("expected forbidden error, got {other:?}"),
    }
    let closed = carol_ws.next().await;
    assert!(matches!(closed, None | Some(Ok(Message::Close(_)))));

    // A denied user can no longer reconnect.
    let reconnect = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={}", target.token)).await;
    assert!(reconnect.is_err());
}
