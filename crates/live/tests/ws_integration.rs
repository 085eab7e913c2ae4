use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quire_common::protocol::events::{ErrorCode, ErrorType, ServerEvent};
use quire_common::types::{DocumentKey, Entitlements};
use quire_live::auth::entitlements::EntitlementStore;
use quire_live::auth::jwt::TokenService;
use quire_live::backplane::{Backplane, MemoryHub};
use quire_live::config::{HeartbeatConfig, SessionConfig};
use quire_live::crdt::Replica;
use quire_live::persistence::{DocumentStore, LoadError, MemoryStore};
use quire_live::server::{serve, AppState};
use quire_live::session::SessionRegistry;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use yrs::sync::{Awareness, DefaultProtocol, Message, Protocol, SyncMessage};
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SECRET: &str = "quire_test_secret_that_is_definitely_long_enough";
const MAX_UPDATE_BYTES: usize = 4 * 1024;

struct TestServer {
    addr: SocketAddr,
    tokens: TokenService,
    registry: SessionRegistry,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(store: MemoryStore, entitlements: EntitlementStore, backplane: Backplane) -> Self {
        Self::start_with(store, entitlements, backplane, HeartbeatConfig::default()).await
    }

    async fn start_with(
        store: MemoryStore,
        entitlements: EntitlementStore,
        backplane: Backplane,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");

        let config = SessionConfig {
            debounce: Duration::from_millis(50),
            max_debounce: Duration::from_millis(200),
            teardown_grace: Duration::ZERO,
            max_update_bytes: MAX_UPDATE_BYTES,
        };
        let registry = SessionRegistry::new(DocumentStore::Memory(store), backplane, config);
        let state = AppState::new(
            registry.clone(),
            TokenService::new(SECRET).expect("token service should initialize"),
            entitlements,
            "broadcast-secret",
            MAX_UPDATE_BYTES,
        )
        .with_heartbeat(heartbeat);

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, state, async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            tokens: TokenService::new(SECRET).expect("token service should initialize"),
            registry,
            shutdown: Some(shutdown),
            task,
        }
    }

    fn url(&self, key: DocumentKey, token: &str) -> String {
        format!(
            "ws://{}/collaboration/{}/{}?token={token}",
            self.addr, key.workspace_id, key.document_id
        )
    }

    async fn connect(&self, key: DocumentKey, user_id: Uuid) -> ClientSocket {
        let token = self.tokens.issue(user_id, key.workspace_id).expect("token should issue");
        let (socket, _) = connect_async(self.url(key, &token)).await.expect("client should connect");
        socket
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

enum Frame {
    Binary(Vec<u8>),
    Event(ServerEvent),
    Closed,
}

async fn recv_frame(socket: &mut ClientSocket) -> Frame {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let Some(message) = next else {
            return Frame::Closed;
        };
        let Ok(message) = message else {
            return Frame::Closed;
        };

        match message {
            WsMessage::Binary(payload) => return Frame::Binary(payload.to_vec()),
            WsMessage::Text(raw) => {
                return Frame::Event(
                    ServerEvent::decode(raw.as_str()).expect("server text frames should decode"),
                )
            }
            WsMessage::Ping(payload) => {
                socket.send(WsMessage::Pong(payload)).await.expect("websocket should reply to ping");
            }
            WsMessage::Close(_) => return Frame::Closed,
            WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

async fn recv_binary(socket: &mut ClientSocket) -> Vec<u8> {
    loop {
        match recv_frame(socket).await {
            Frame::Binary(payload) => return payload,
            Frame::Event(_) => {}
            Frame::Closed => panic!("websocket closed unexpectedly"),
        }
    }
}

async fn recv_event(socket: &mut ClientSocket) -> ServerEvent {
    loop {
        match recv_frame(socket).await {
            Frame::Event(event) => return event,
            Frame::Binary(_) => {}
            Frame::Closed => panic!("websocket closed before an event arrived"),
        }
    }
}

async fn handshake(socket: &mut ClientSocket, awareness: &Awareness, protocol: &DefaultProtocol) {
    let step1 = Message::Sync(SyncMessage::SyncStep1(awareness.doc().transact().state_vector()))
        .encode_v1();
    socket.send(WsMessage::Binary(step1.into())).await.expect("client should send sync step 1");

    // Server responds with step-2 (its state) followed by step-1 (requesting client's state).
    for _ in 0..2 {
        let incoming = recv_binary(socket).await;
        let responses = protocol
            .handle(awareness, &incoming)
            .expect("client should decode y-sync handshake message");

        for response in responses {
            socket
                .send(WsMessage::Binary(response.encode_v1().into()))
                .await
                .expect("client should send handshake response");
        }
    }
}

fn push_text(awareness: &Awareness, chunk: &str) -> Vec<u8> {
    let text = awareness.doc().get_or_insert_text("content");
    let mut txn = awareness.doc().transact_mut();
    text.push(&mut txn, chunk);
    txn.encode_update_v1()
}

fn text_content(awareness: &Awareness) -> String {
    let txn = awareness.doc().transact();
    txn.get_text("content").map(|text| text.get_string(&txn)).unwrap_or_default()
}

fn snapshot_text(snapshot: &[u8]) -> String {
    let replica = Replica::from_snapshot(snapshot).expect("snapshot should decode");
    let txn = replica.doc().transact();
    txn.get_text("content").map(|text| text.get_string(&txn)).unwrap_or_default()
}

async fn wait_for_text(
    socket: &mut ClientSocket,
    awareness: &Awareness,
    protocol: &DefaultProtocol,
    expected: &str,
) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while text_content(awareness) != expected {
        assert!(Instant::now() < deadline, "client did not converge to {expected:?}");
        let incoming = recv_binary(socket).await;
        let responses = protocol.handle(awareness, &incoming).expect("client should decode y-sync message");
        for response in responses {
            socket
                .send(WsMessage::Binary(response.encode_v1().into()))
                .await
                .expect("client should send protocol response");
        }
    }
}

fn key() -> DocumentKey {
    DocumentKey::new(Uuid::new_v4(), Uuid::new_v4())
}

#[tokio::test]
async fn two_clients_converge_and_persist() {
    let store = MemoryStore::new();
    let server =
        TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let protocol = DefaultProtocol;
    let key = key();

    let mut socket_a = server.connect(key, Uuid::new_v4()).await;
    let client_a = Awareness::new(Doc::with_client_id(1));
    push_text(&client_a, "from-a");
    handshake(&mut socket_a, &client_a, &protocol).await;

    let mut socket_b = server.connect(key, Uuid::new_v4()).await;
    let client_b = Awareness::new(Doc::with_client_id(2));
    handshake(&mut socket_b, &client_b, &protocol).await;
    wait_for_text(&mut socket_b, &client_b, &protocol, "from-a").await;

    let update = push_text(&client_b, " + b");
    socket_b
        .send(WsMessage::Binary(Message::Sync(SyncMessage::Update(update)).encode_v1().into()))
        .await
        .expect("client B should send incremental update");

    wait_for_text(&mut socket_a, &client_a, &protocol, "from-a + b").await;

    let _ = socket_a.close(None).await;
    let _ = socket_b.close(None).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(stored) = store.snapshot(key).await {
            if snapshot_text(&stored) == "from-a + b" {
                break;
            }
        }
        assert!(Instant::now() < deadline, "document was not persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.stop().await;
}

#[tokio::test]
async fn clients_on_different_processes_converge_over_the_backplane() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let left = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Memory(hub.clone())).await;
    let right = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Memory(hub)).await;
    let protocol = DefaultProtocol;
    let key = key();

    let mut socket_a = left.connect(key, Uuid::new_v4()).await;
    let client_a = Awareness::new(Doc::with_client_id(1));
    handshake(&mut socket_a, &client_a, &protocol).await;

    let mut socket_b = right.connect(key, Uuid::new_v4()).await;
    let client_b = Awareness::new(Doc::with_client_id(2));
    handshake(&mut socket_b, &client_b, &protocol).await;

    let update = push_text(&client_a, "across processes");
    socket_a
        .send(WsMessage::Binary(Message::Sync(SyncMessage::Update(update)).encode_v1().into()))
        .await
        .expect("client A should send update");

    wait_for_text(&mut socket_b, &client_b, &protocol, "across processes").await;

    let _ = socket_a.close(None).await;
    let _ = socket_b.close(None).await;
    left.stop().await;
    right.stop().await;
}

#[tokio::test]
async fn locked_document_rejects_writes_but_keeps_the_connection() {
    let store = MemoryStore::new();
    let entitlements = EntitlementStore::deny_by_default();
    let key = key();
    let user = Uuid::new_v4();
    entitlements.grant(key, user, Entitlements { is_locked: true, ..Entitlements::read_write() }).await;

    let server = TestServer::start(store.clone(), entitlements, Backplane::Disabled).await;
    let protocol = DefaultProtocol;
    let mut socket = server.connect(key, user).await;
    let client = Awareness::new(Doc::with_client_id(7));
    handshake(&mut socket, &client, &protocol).await;

    let update = push_text(&client, "blocked");
    socket
        .send(WsMessage::Binary(Message::Sync(SyncMessage::Update(update)).encode_v1().into()))
        .await
        .expect("client should send update");

    let ServerEvent::Error(event) = recv_event(&mut socket).await else {
        panic!("expected an error event");
    };
    assert_eq!(event.error_type, ErrorType::Store);
    assert_eq!(event.error_code, Some(ErrorCode::PageLocked));
    assert!(!event.should_disconnect);
    assert_eq!(event.user_id, user);

    // Still connected and still readable.
    let step1 = Message::Sync(SyncMessage::SyncStep1(Default::default())).encode_v1();
    socket.send(WsMessage::Binary(step1.into())).await.expect("socket should stay open");
    let reply = recv_binary(&mut socket).await;
    assert!(!reply.is_empty());

    let _ = socket.close(None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.save_attempts(), 0);
    assert!(store.snapshot(key).await.is_none());
    server.stop().await;
}

#[tokio::test]
async fn oversized_handshake_update_disconnects() {
    let store = MemoryStore::new();
    let server = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let key = key();
    let mut socket = server.connect(key, Uuid::new_v4()).await;

    let oversized = Message::Sync(SyncMessage::SyncStep2(vec![1; MAX_UPDATE_BYTES + 1])).encode_v1();
    socket.send(WsMessage::Binary(oversized.into())).await.expect("client should send step 2");

    let ServerEvent::Error(event) = recv_event(&mut socket).await else {
        panic!("expected an error event");
    };
    assert_eq!(event.error_code, Some(ErrorCode::ContentTooLarge));
    assert!(event.should_disconnect);

    loop {
        match recv_frame(&mut socket).await {
            Frame::Closed => break,
            Frame::Binary(_) | Frame::Event(_) => {}
        }
    }
    assert_eq!(store.save_attempts(), 0);
    server.stop().await;
}

#[tokio::test]
async fn frame_beyond_transport_limit_is_reported_before_close() {
    let store = MemoryStore::new();
    let server = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let key = key();
    let user = Uuid::new_v4();
    let mut socket = server.connect(key, user).await;

    let oversized =
        Message::Sync(SyncMessage::Update(vec![1; MAX_UPDATE_BYTES + 128 * 1024])).encode_v1();
    socket.send(WsMessage::Binary(oversized.into())).await.expect("client should send update");

    let mut errors = Vec::new();
    loop {
        match recv_frame(&mut socket).await {
            Frame::Event(ServerEvent::Error(event)) => errors.push(event),
            Frame::Closed => break,
            Frame::Event(_) | Frame::Binary(_) => {}
        }
    }

    assert_eq!(errors.len(), 1, "expected one error event, got {errors:?}");
    assert_eq!(errors[0].error_type, ErrorType::Store);
    assert_eq!(errors[0].error_code, Some(ErrorCode::ContentTooLarge));
    assert!(errors[0].should_disconnect);
    assert_eq!(errors[0].user_id, user);
    assert_eq!(store.save_attempts(), 0);
    server.stop().await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_missed_heartbeats() {
    let heartbeat =
        HeartbeatConfig { interval: Duration::from_millis(50), timeout: Duration::from_millis(50) };
    let server = TestServer::start_with(
        MemoryStore::new(),
        EntitlementStore::permissive(),
        Backplane::Disabled,
        heartbeat,
    )
    .await;
    let protocol = DefaultProtocol;
    let key = key();

    let mut socket = server.connect(key, Uuid::new_v4()).await;
    handshake(&mut socket, &Awareness::new(Doc::with_client_id(11)), &protocol).await;
    assert_eq!(server.registry.status(key).await.map(|status| status.clients), Some(1));

    // The client stops reading, so pings go unanswered.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match server.registry.status(key).await {
            None => break,
            Some(status) if status.clients == 0 => break,
            Some(_) => {}
        }
        assert!(Instant::now() < deadline, "silent connection was never deregistered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let hung_up = timeout(Duration::from_secs(2), async {
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;
    assert!(hung_up.is_ok(), "server should close the socket of a silent client");
    server.stop().await;
}

#[tokio::test]
async fn load_failure_sends_fetch_error_and_closes() {
    let store = MemoryStore::new();
    store.fail_next_loads([LoadError::Unavailable("database down".into())]).await;
    let server = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let key = key();

    let mut socket = server.connect(key, Uuid::new_v4()).await;
    let ServerEvent::Error(event) = recv_event(&mut socket).await else {
        panic!("expected a fetch error");
    };
    assert_eq!(event.error_type, ErrorType::Fetch);
    assert!(event.should_disconnect);
    assert!(matches!(recv_frame(&mut socket).await, Frame::Closed));

    // The failure is not cached.
    let protocol = DefaultProtocol;
    let mut retry = server.connect(key, Uuid::new_v4()).await;
    handshake(&mut retry, &Awareness::new(Doc::with_client_id(3)), &protocol).await;
    assert_eq!(store.load_calls(), 2);

    let _ = retry.close(None).await;
    server.stop().await;
}

#[tokio::test]
async fn connection_without_valid_token_is_refused() {
    let server = TestServer::start(MemoryStore::new(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let key = key();

    match connect_async(server.url(key, "not-a-token")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("expected an HTTP refusal, got {other:?}"),
        Ok(_) => panic!("invalid token should be refused"),
    }

    server.stop().await;
}

#[tokio::test]
async fn realtime_lock_event_blocks_later_writes() {
    let store = MemoryStore::new();
    let server = TestServer::start(store.clone(), EntitlementStore::permissive(), Backplane::Disabled).await;
    let protocol = DefaultProtocol;
    let key = key();

    let mut socket = server.connect(key, Uuid::new_v4()).await;
    let client = Awareness::new(Doc::with_client_id(9));
    handshake(&mut socket, &client, &protocol).await;

    let response = post_broadcast(server.addr, key, "locked").await;
    assert!(response.contains("\"success\":true"), "unexpected broadcast response: {response}");

    let ServerEvent::Realtime(event) = recv_event(&mut socket).await else {
        panic!("expected a realtime event");
    };
    assert_eq!(event.action, "locked");

    let update = push_text(&client, "after lock");
    socket
        .send(WsMessage::Binary(Message::Sync(SyncMessage::Update(update)).encode_v1().into()))
        .await
        .expect("client should send update");
    let ServerEvent::Error(error) = recv_event(&mut socket).await else {
        panic!("expected a lock rejection");
    };
    assert_eq!(error.error_code, Some(ErrorCode::PageLocked));

    let _ = socket.close(None).await;
    server.stop().await;
}

async fn post_broadcast(addr: SocketAddr, key: DocumentKey, action: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let body = serde_json::json!({
        "action": action,
        "pageIds": [key.document_id],
        "workspaceId": key.workspace_id,
    })
    .to_string();
    let request = format!(
        "POST /broadcast HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\nx-broadcast-secret: broadcast-secret\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("http connect");
    stream.write_all(request.as_bytes()).await.expect("http write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("http read");
    response
}
