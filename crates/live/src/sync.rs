//! Collaboration WebSocket endpoint.
//!
//! `GET /collaboration/{workspace_id}/{document_id}` authorizes the caller,
//! upgrades, joins the document session and then pumps y-sync and awareness
//! frames between the socket and the session. Server events (errors and
//! realtime notifications) travel as JSON text frames.

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use quire_common::protocol::events::ServerEvent;
use quire_common::protocol::sync::decode_frame;
use quire_common::types::{DocumentKey, Entitlements};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yrs::sync::{Message as SyncFrame, SyncMessage};

use crate::auth::jwt::extract_bearer_token;
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::guard::{self, apply_status_event, fetch_error_event, Admission, WriteKind, WriteVerdict};
use crate::server::AppState;
use crate::session::{ClientHandle, Outbound, SessionMembership};

/// Room above the update limit for y-sync framing, so oversized updates
/// reach the guard instead of being cut off by the transport.
const FRAME_HEADROOM_BYTES: usize = 64 * 1024;

pub fn router() -> Router<AppState> {
    Router::new().route("/collaboration/{workspace_id}/{document_id}", get(ws_upgrade))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn ws_upgrade(
    Path((workspace_id, document_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let key = DocumentKey::new(workspace_id, document_id);
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .or(query.token);

    let admission =
        match guard::authorize(&state.tokens, &state.entitlements, key, token.as_deref()).await {
            Ok(admission) => admission,
            Err(error) => return error.into_response(),
        };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame_bytes = state.max_update_bytes.saturating_add(FRAME_HEADROOM_BYTES);
    ws.max_frame_size(max_frame_bytes)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, key, admission, socket)).await;
        })
}

/// What the socket loop does after an inbound frame.
enum Inbound {
    Continue,
    Reject(ServerEvent, bool),
}

/// Per-connection protocol state.
struct Connection {
    key: DocumentKey,
    user_id: Uuid,
    entitlements: Entitlements,
    max_update_bytes: usize,
    membership: SessionMembership,
}

impl Connection {
    fn handle_binary(&self, frame: &[u8]) -> Vec<Inbound> {
        let messages = match decode_frame(frame) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(
                    document_id = %self.key.document_id,
                    connection_id = %self.membership.connection_id(),
                    error = %error,
                    "dropping malformed sync frame"
                );
                return Vec::new();
            }
        };

        messages.into_iter().map(|message| self.handle_message(message)).collect()
    }

    fn handle_message(&self, message: SyncFrame) -> Inbound {
        match message {
            SyncFrame::Sync(SyncMessage::SyncStep1(state_vector)) => {
                self.membership.sync_step1(state_vector);
                Inbound::Continue
            }
            SyncFrame::Sync(SyncMessage::SyncStep2(update)) => self.write(update, WriteKind::Handshake),
            SyncFrame::Sync(SyncMessage::Update(update)) => self.write(update, WriteKind::Incremental),
            SyncFrame::Awareness(update) => {
                self.membership.awareness(update);
                Inbound::Continue
            }
            SyncFrame::AwarenessQuery => {
                self.membership.awareness_query();
                Inbound::Continue
            }
            // Auth and custom messages carry nothing this server acts on.
            _ => Inbound::Continue,
        }
    }

    fn write(&self, update: Vec<u8>, kind: WriteKind) -> Inbound {
        match guard::check_write(&self.entitlements, &update, self.max_update_bytes, kind) {
            WriteVerdict::Apply => {
                self.membership.update(update);
                Inbound::Continue
            }
            WriteVerdict::Skip => Inbound::Continue,
            WriteVerdict::ReadOnly => {
                debug!(
                    document_id = %self.key.document_id,
                    user_id = %self.user_id,
                    bytes = update.len(),
                    "dropping write from read-only connection"
                );
                Inbound::Continue
            }
            WriteVerdict::Reject(rejection) => {
                warn!(
                    document_id = %self.key.document_id,
                    user_id = %self.user_id,
                    code = rejection.code.as_str(),
                    bytes = update.len(),
                    "rejected write"
                );
                Inbound::Reject(
                    ServerEvent::Error(rejection.to_event(self.user_id)),
                    rejection.should_disconnect,
                )
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = event.encode().map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: "websocket frame exceeds maximum size".into(),
        })))
        .await;
}

async fn handle_socket(state: AppState, key: DocumentKey, admission: Admission, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (client, mut outbound) = ClientHandle::new(admission.user_id);
    let connection_id = client.id;

    let membership = match state.registry.acquire(key, client).await {
        Ok(membership) => membership,
        Err(error) => {
            warn!(
                request_id = %request_id,
                document_id = %key.document_id,
                user_id = %admission.user_id,
                error = %error,
                "refusing connection, document could not be loaded"
            );
            let event = ServerEvent::Error(fetch_error_event(&error, admission.user_id));
            let _ = send_event(&mut socket, &event).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        request_id = %request_id,
        workspace_id = %key.workspace_id,
        document_id = %key.document_id,
        connection_id = %connection_id,
        user_id = %admission.user_id,
        can_write = admission.entitlements.can_write,
        "collaboration connection opened"
    );

    let mut connection = Connection {
        key,
        user_id: admission.user_id,
        entitlements: admission.entitlements,
        max_update_bytes: state.max_update_bytes,
        membership,
    };

    let mut heartbeat_interval = tokio::time::interval(state.heartbeat.interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = state.heartbeat.deadline();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        request_id = %request_id,
                        connection_id = %connection_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound.recv() => {
                match maybe_outbound {
                    Some(Outbound::Binary(frame)) => {
                        if socket.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Event(event)) => {
                        if let ServerEvent::Realtime(realtime) = &event {
                            if apply_status_event(&mut connection.entitlements, key.document_id, realtime) {
                                debug!(
                                    connection_id = %connection_id,
                                    locked = connection.entitlements.is_locked,
                                    archived = connection.entitlements.is_archived,
                                    "document status changed"
                                );
                            }
                        }
                        let disconnect = matches!(&event, ServerEvent::Error(error) if error.should_disconnect);
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                        if disconnect {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Binary(frame)) => {
                        let mut disconnect = false;
                        let mut send_failed = false;
                        for outcome in connection.handle_binary(&frame) {
                            if let Inbound::Reject(event, should_disconnect) = outcome {
                                if send_event(&mut socket, &event).await.is_err() {
                                    send_failed = true;
                                    break;
                                }
                                if should_disconnect {
                                    disconnect = true;
                                    break;
                                }
                            }
                        }
                        if disconnect {
                            let _ = socket.send(Message::Close(None)).await;
                        }
                        if disconnect || send_failed {
                            break;
                        }
                    }
                    Ok(Message::Text(_)) => {
                        debug!(connection_id = %connection_id, "ignoring text frame");
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) if is_frame_size_violation(&error) => {
                        let rejection = guard::oversized_frame_rejection(connection.max_update_bytes);
                        warn!(
                            document_id = %key.document_id,
                            user_id = %connection.user_id,
                            code = rejection.code.as_str(),
                            error = %error,
                            "rejected oversized frame"
                        );
                        let event = ServerEvent::Error(rejection.to_event(connection.user_id));
                        let _ = send_event(&mut socket, &event).await;
                        close_frame_too_large(&mut socket).await;
                        break;
                    }
                    Err(error) => {
                        debug!(connection_id = %connection_id, error = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    drop(connection);
    info!(
        request_id = %request_id,
        document_id = %key.document_id,
        connection_id = %connection_id,
        "collaboration connection closed"
    );
}
