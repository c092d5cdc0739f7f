//! End-to-end tests: a real server on an OS-assigned port, driven by
//! `tokio-tungstenite` clients speaking JSON.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tavern::prelude::*;
use tokio_tungstenite::tungstenite::Message;

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Starts a server with the dev authenticator and returns its address.
///
/// No snapshot store, so join replies are sent before the join returns.
async fn start_server() -> SocketAddr {
    let server = TavernServerBuilder::new()
        .bind("127.0.0.1:0")
        .build(DevAuthenticator)
        .await
        .expect("server should bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

struct Player {
    ws: ClientWs,
}

impl Player {
    /// Connects without handshaking.
    async fn connect_raw(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        Self { ws }
    }

    /// Connects and completes the handshake with a dev token.
    async fn connect(addr: SocketAddr, token: &str) -> Self {
        let mut player = Self::connect_raw(addr).await;
        player
            .send(ClientEvent::Handshake(PROTOCOL_VERSION, Some(token.into())))
            .await;
        match player.next().await {
            ServerEvent::HandshakeAck(..) => player,
            other => panic!("expected handshake-ack, got {other:?}"),
        }
    }

    async fn send(&mut self, event: ClientEvent) {
        let text = serde_json::to_string(&event).expect("encode");
        self.send_text(&text).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("client send");
    }

    async fn next(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("ws error");
            match msg {
                Message::Binary(data) => {
                    return serde_json::from_slice(&data).expect("server frame should decode");
                }
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).expect("server frame should decode");
                }
                _ => continue,
            }
        }
    }

    /// Next frame, which must be `operation-failed`; returns its reason.
    async fn next_failure(&mut self) -> String {
        match self.next().await {
            ServerEvent::OperationFailed(reason) => reason,
            other => panic!("expected operation-failed, got {other:?}"),
        }
    }

    /// Sends a heartbeat and collects everything that arrives before its
    /// ack. The outbox is ordered, so this is everything already queued.
    async fn flush(&mut self) -> Vec<ServerEvent> {
        self.send(ClientEvent::Heartbeat(7)).await;
        let mut events = Vec::new();
        loop {
            match self.next().await {
                ServerEvent::HeartbeatAck(7, _) => return events,
                event => events.push(event),
            }
        }
    }
}

fn room() -> RoomId {
    RoomId::from("R1")
}

async fn host_session(addr: SocketAddr) -> Player {
    let mut host = Player::connect(addr, "H:Hana").await;
    host.send(ClientEvent::CreateSession(
        room(),
        UserId::from("H"),
        SetRef::from("S1"),
        "Crypt".into(),
    ))
    .await;
    assert_eq!(host.next().await, ServerEvent::SessionReady(room()));
    host
}

async fn guest(addr: SocketAddr, token: &str, user: &str, name: &str) -> Player {
    let mut guest = Player::connect(addr, token).await;
    guest
        .send(ClientEvent::JoinSession(UserId::from(user), name.into(), room()))
        .await;
    guest
}

// -- Handshake ----------------------------------------------------------------

#[tokio::test]
async fn test_handshake_ack_carries_identity() {
    let addr = start_server().await;
    let mut player = Player::connect_raw(addr).await;

    player
        .send(ClientEvent::Handshake(PROTOCOL_VERSION, Some("u-1:Bea".into())))
        .await;

    assert_eq!(
        player.next().await,
        ServerEvent::HandshakeAck(UserId::from("u-1"), "Bea".into())
    );
}

#[tokio::test]
async fn test_handshake_version_mismatch_rejected() {
    let addr = start_server().await;
    let mut player = Player::connect_raw(addr).await;

    player
        .send(ClientEvent::Handshake(PROTOCOL_VERSION + 1, Some("u-1".into())))
        .await;

    let reason = player.next_failure().await;
    assert!(reason.contains("version mismatch"), "got: {reason}");
}

#[tokio::test]
async fn test_first_frame_must_be_handshake() {
    let addr = start_server().await;
    let mut player = Player::connect_raw(addr).await;

    player.send(ClientEvent::EndTurn(room())).await;

    let reason = player.next_failure().await;
    assert!(reason.contains("first message must be a handshake"), "got: {reason}");
}

#[tokio::test]
async fn test_handshake_without_token_rejected() {
    let addr = start_server().await;
    let mut player = Player::connect_raw(addr).await;

    player.send(ClientEvent::Handshake(PROTOCOL_VERSION, None)).await;

    assert_eq!(player.next_failure().await, "missing credentials");
}

// -- Connection upkeep --------------------------------------------------------

#[tokio::test]
async fn test_heartbeat_echoes_client_time() {
    let addr = start_server().await;
    let mut player = Player::connect(addr, "u-1").await;

    player.send(ClientEvent::Heartbeat(1234)).await;

    match player.next().await {
        ServerEvent::HeartbeatAck(client_time, _) => assert_eq!(client_time, 1234),
        other => panic!("expected heartbeat-ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_frames_are_skipped() {
    let addr = start_server().await;
    let mut player = Player::connect(addr, "u-1").await;

    player.send_text("not json at all").await;
    player.send_text(r#"{"event": "fly-to-moon"}"#).await;

    assert!(player.flush().await.is_empty());
}

#[tokio::test]
async fn test_known_event_with_bad_arguments_is_answered() {
    let addr = start_server().await;
    let _host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    ann.flush().await;

    ann.send_text(r#"{"event": "submit-roll", "args": ["R1", 300, "Ann", 0]}"#)
        .await;
    assert_eq!(ann.next_failure().await, "malformed submit-roll arguments");

    ann.send_text(r#"{"event": "grant-access", "args": ["R1", "0"]}"#)
        .await;
    assert_eq!(ann.next_failure().await, "malformed grant-access arguments");

    // In range but nothing pending: a room-level failure, not a shape one.
    ann.send_text(r#"{"event": "submit-roll", "args": ["R1", 21, "Ann", 0]}"#)
        .await;
    let reason = ann.next_failure().await;
    assert!(!reason.starts_with("malformed"), "got: {reason}");
}

// -- Sessions -----------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_room_id_rejected() {
    let addr = start_server().await;
    let _host = host_session(addr).await;
    let mut other = Player::connect(addr, "X").await;

    other
        .send(ClientEvent::CreateSession(
            room(),
            UserId::from("X"),
            SetRef::from("S2"),
            "Other".into(),
        ))
        .await;

    assert_eq!(other.next_failure().await, "Name: 'R1' already taken!");
}

#[tokio::test]
async fn test_join_unknown_room() {
    let addr = start_server().await;
    let mut player = Player::connect(addr, "A").await;

    player
        .send(ClientEvent::JoinSession(
            UserId::from("A"),
            "Ann".into(),
            RoomId::from("R9"),
        ))
        .await;

    assert_eq!(player.next_failure().await, "Couldn't find game: 'R9'");
}

#[tokio::test]
async fn test_cannot_create_session_as_someone_else() {
    let addr = start_server().await;
    let mut player = Player::connect(addr, "A").await;

    player
        .send(ClientEvent::CreateSession(
            room(),
            UserId::from("H"),
            SetRef::from("S1"),
            "Crypt".into(),
        ))
        .await;

    let reason = player.next_failure().await;
    assert!(reason.starts_with("'A' is not allowed to"), "got: {reason}");
}

#[tokio::test]
async fn test_guest_cannot_start_turn() {
    let addr = start_server().await;
    let _host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    ann.flush().await;

    ann.send(ClientEvent::StartTurn(room(), Snapshot("{}".into())))
        .await;

    assert_eq!(ann.next_failure().await, "'A' is not allowed to start a turn");
}

#[tokio::test]
async fn test_full_turn_over_the_wire() {
    let addr = start_server().await;
    let mut host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;

    assert_eq!(
        ann.next().await,
        ServerEvent::GuestJoin(room(), SetRef::from("S1"), None, None)
    );
    assert_eq!(host.next().await, ServerEvent::Log("Ann has connected".into()));

    // Access request, listed and granted by the host.
    ann.send(ClientEvent::RequestAccess(
        room(),
        UserId::from("A"),
        "Ann".into(),
        Token::from("a"),
    ))
    .await;
    assert_eq!(
        host.next().await,
        ServerEvent::Log("'Ann' is requesting access to a".into())
    );

    host.send(ClientEvent::ListAccessRequests(room())).await;
    match host.next().await {
        ServerEvent::PendingAccessRequests(requests) => {
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].id, RequestId(0));
            assert_eq!(requests[0].requested_token, Token::from("a"));
        }
        other => panic!("expected pending-access-requests, got {other:?}"),
    }

    host.send(ClientEvent::GrantAccess(room(), RequestId(0))).await;
    assert_eq!(ann.next().await, ServerEvent::GrantToken(Some(Token::from("a"))));

    // Turn opens.
    host.send(ClientEvent::StartTurn(room(), Snapshot("{\"turn\":1}".into())))
        .await;
    // The host's flush returns only after its start-turn was applied.
    assert_eq!(
        host.flush().await,
        vec![ServerEvent::RefreshSnapshot, ServerEvent::GrantAllAccess]
    );
    assert_eq!(
        ann.flush().await,
        vec![
            ServerEvent::GrantToken(Some(Token::from("a"))),
            ServerEvent::RefreshSnapshot,
        ]
    );

    // Ann submits, the host closes the turn.
    let move_action = Action(json!({"action_type": 0, "caster": "a"}));
    ann.send(ClientEvent::SubmitTurn(
        room(),
        UserId::from("A"),
        "Ann".into(),
        vec![move_action.clone()],
    ))
    .await;
    assert_eq!(ann.next().await, ServerEvent::Log("'Ann' has ended turn".into()));
    assert_eq!(host.next().await, ServerEvent::Log("'Ann' has ended turn".into()));

    host.send(ClientEvent::EndTurn(room())).await;
    let host_events = host.flush().await;
    match &host_events[..] {
        [ServerEvent::ActionQueue(queue), ServerEvent::ResyncBoard] => {
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].user_id, UserId::from("A"));
            assert_eq!(queue[0].actions, vec![move_action]);
        }
        other => panic!("unexpected host events: {other:?}"),
    }
    assert_eq!(
        ann.flush().await,
        vec![ServerEvent::RevokeTurnAccess, ServerEvent::ResyncBoard]
    );
}

#[tokio::test]
async fn test_rejoin_restores_role_and_snapshot() {
    let addr = start_server().await;
    let mut host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    ann.flush().await;

    ann.send(ClientEvent::RequestAccess(
        room(),
        UserId::from("A"),
        "Ann".into(),
        Token::from("a"),
    ))
    .await;
    host.flush().await;
    host.send(ClientEvent::GrantAccess(room(), RequestId(0))).await;
    host.send(ClientEvent::StartTurn(room(), Snapshot("snap-1".into())))
        .await;
    host.flush().await;
    drop(ann);

    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    assert_eq!(
        ann.next().await,
        ServerEvent::GuestJoin(
            room(),
            SetRef::from("S1"),
            Some(Token::from("a")),
            Some(Snapshot("snap-1".into())),
        )
    );
}

#[tokio::test]
async fn test_relay_action_needs_a_room() {
    let addr = start_server().await;
    let mut player = Player::connect(addr, "A").await;

    player.send(ClientEvent::RelayAction(Action(json!({"action_type": 1})))).await;

    assert_eq!(player.next_failure().await, "not in any game");
}

#[tokio::test]
async fn test_relay_action_reaches_everyone_but_sender() {
    let addr = start_server().await;
    let mut host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    ann.flush().await;
    host.flush().await;

    let action = Action(json!({"action_type": 1, "caster": "h"}));
    host.send(ClientEvent::RelayAction(action.clone())).await;

    assert_eq!(ann.next().await, ServerEvent::ExecuteAction(action));
    assert!(host.flush().await.is_empty());
}

#[tokio::test]
async fn test_join_replays_stored_snapshot() {
    let server = TavernServerBuilder::new()
        .bind("127.0.0.1:0")
        .store(MemoryStore::with_snapshot(
            SetRef::from("S1"),
            Snapshot("saved".into()),
        ))
        .build(DevAuthenticator)
        .await
        .expect("server should bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());

    let _host = host_session(addr).await;
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;

    assert_eq!(
        ann.next().await,
        ServerEvent::GuestJoin(
            room(),
            SetRef::from("S1"),
            None,
            Some(Snapshot("saved".into())),
        )
    );
}

#[tokio::test]
async fn test_confirm_ready_repeats_session_ready() {
    let addr = start_server().await;
    let mut host = host_session(addr).await;

    host.send(ClientEvent::ConfirmReady(room())).await;
    assert_eq!(host.next().await, ServerEvent::SessionReady(room()));

    host.send(ClientEvent::ConfirmReady(RoomId::from("R9"))).await;
    assert_eq!(host.next_failure().await, "Couldn't find game: 'R9'");
}

#[tokio::test]
async fn test_idle_room_is_reaped_and_its_name_freed() {
    let mut config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        reap_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    };
    config.room.idle_timeout = Duration::from_millis(50);
    let server = TavernServerBuilder::new()
        .config(config)
        .build(DevAuthenticator)
        .await
        .expect("server should bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());

    let host = host_session(addr).await;
    drop(host);

    let mut next_host = Player::connect(addr, "H:Hana").await;
    let mut recreated = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        next_host
            .send(ClientEvent::CreateSession(
                room(),
                UserId::from("H"),
                SetRef::from("S1"),
                "Crypt".into(),
            ))
            .await;
        match next_host.next().await {
            ServerEvent::SessionReady(id) => {
                assert_eq!(id, room());
                recreated = true;
                break;
            }
            ServerEvent::OperationFailed(reason) => {
                assert_eq!(reason, "Name: 'R1' already taken!");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(recreated, "idle room was never reaped");

    // The recreated room is live, so a guest can join it.
    let mut ann = guest(addr, "A:Ann", "A", "Ann").await;
    assert!(matches!(ann.next().await, ServerEvent::GuestJoin(..)));
}
