// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Session layer: the WebSocket upgrade handler and the per-connection
//! event loop (§4.1, §4.2). A session owns exactly one socket and the
//! receiving end of its outbound channel; the hub only ever holds a
//! non-owning `SessionHandle`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use fabric_core::error::ErrorCode;
use fabric_core::ids::{ChatId, ClientUuid, DeviceId, UserId};
use fabric_core::protocol::{ClientFrame, DeliveryEnvelope, ReadReceiptEvent, ServerFrame};
use fabric_core::subjects::{delivered_ack_subject, delivery_subject, READ_RECEIPTS_SUBJECT};
use fabric_core::time::epoch_ms;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::SessionHandle;
use crate::state::AppState;

#[derive(Debug, serde::Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    device: Option<String>,
}

/// WebSocket upgrade handler: rate-limits by source address, then
/// upgrades unconditionally — bearer credentials are validated only
/// after the handshake completes, since a close code is the only
/// failure signal a browser `WebSocket` can observe (§4.1, §8 property
/// 1: "invalid credential ⇒ refused with close code 4000").
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.rate_limiter.try_acquire(addr.ip()).await {
        return axum::http::Response::builder()
            .status(429)
            .body(axum::body::Body::from("rate limited"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| authenticate_then_serve(state, socket, query))
        .into_response()
}

/// Validates the credentials carried on the upgrade query string, now
/// that the socket is open; closes with 4000 on any failure instead of
/// ever reading or writing past the handshake.
async fn authenticate_then_serve(state: Arc<AppState>, mut socket: WebSocket, query: WsQuery) {
    let Some(token) = query.token.as_deref() else {
        reject(&mut socket, "missing bearer token").await;
        return;
    };
    let user_id = match state.jwt.verify(token) {
        Ok(user_id) => user_id,
        Err(_) => {
            reject(&mut socket, "invalid bearer token").await;
            return;
        }
    };
    let Some(device) = query.device.as_deref() else {
        reject(&mut socket, "missing device").await;
        return;
    };
    let device_id = DeviceId::from(device.to_string());

    handle_connection(state, socket, user_id, device_id).await;
}

/// Refuses an upgraded socket with close code 4000, the canonical
/// invalid-credential signal for this protocol.
async fn reject(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code: 4000, reason: reason.into() })))
        .await;
}

/// Per-connection event loop. Registers in the hub, marks presence
/// online, and runs until the client disconnects, the process is
/// shutting down, or the hub displaces this session for the same
/// `(userId, deviceId)` pair.
async fn handle_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId, device_id: DeviceId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(state.config.outbound_capacity);
    let close = CancellationToken::new();

    let handle = SessionHandle::new(device_id.clone(), out_tx, close.clone());
    state.hub.register(user_id, device_id.clone(), handle).await;
    state
        .cache
        .register_connection(user_id, &device_id, &state.config.effective_replica_id(), state.conn_ttl())
        .await;
    state.presence.mark_online(user_id).await;
    debug!(%user_id, %device_id, "session opened");

    // Bind a delivery queue for every chat this user belongs to, so the
    // session observes messages fanned out by other senders as well as
    // its own (§4.1: "binds delivery queue for each of the user's chats
    // on this replica").
    for chat_id in state.store.user_chat_ids(user_id).await {
        state.hub.subscribe(user_id, device_id.clone(), chat_id).await;
        state
            .delivery
            .ensure_subscribed(chat_id, state.shutdown.clone())
            .await;
    }

    let delivery_ack_sub = match state.nats.subscribe(delivered_ack_subject(user_id)).await {
        Ok(sub) => Some(sub),
        Err(e) => {
            warn!(%user_id, error = %e, "failed to subscribe to delivery-ack subject");
            None
        }
    };
    let mut delivery_ack_sub = delivery_ack_sub;

    let mut ping_interval = tokio::time::interval(state.ping_interval());
    ping_interval.tick().await; // first tick fires immediately, skip it

    loop {
        let idle_read = tokio::time::timeout(state.idle_timeout(), ws_rx.next());

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = close.cancelled() => break,

            _ = ping_interval.tick() => {
                if send_frame(&mut ws_tx, &ServerFrame::Pong { ts: epoch_ms() }).await.is_err() {
                    break;
                }
            }

            Some(frame) = out_rx.recv() => {
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }

            msg = async {
                match delivery_ack_sub.as_mut() {
                    Some(sub) => sub.next().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(msg) = msg else { continue };
                if let Ok(envelope) = serde_json::from_slice::<DeliveryEnvelope>(&msg.payload) {
                    let frame: ServerFrame = envelope.into();
                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                        break;
                    }
                }
            }

            read = idle_read => {
                let msg = match read {
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(_))) | Ok(None) => break,
                    Err(_) => {
                        debug!(%user_id, %device_id, "idle timeout, closing session");
                        break;
                    }
                };

                match msg {
                    Message::Text(text) => {
                        handle_client_frame(&state, &mut ws_tx, user_id, &device_id, &text).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(user_id, &device_id).await;
    state.cache.deregister_connection(user_id, &device_id).await;
    if state.hub.sessions_for_user(user_id).await == 0 {
        state.presence.mark_offline(user_id).await;
    }
    debug!(%user_id, %device_id, "session closed");
}

/// Dispatch a single inbound client frame, publishing to the
/// appropriate broker subject and, for `SendMessage`, confirming
/// durability before replying.
async fn handle_client_frame(
    state: &Arc<AppState>,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    user_id: UserId,
    device_id: &DeviceId,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            let _ = send_frame(
                ws_tx,
                &ServerFrame::Error {
                    code: ErrorCode::Validation,
                    uuid: None,
                    message: "malformed frame".to_string(),
                },
            )
            .await;
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage { uuid, chat_id, body, media_url } => {
            handle_send_message(state, ws_tx, user_id, device_id, uuid, chat_id, body, media_url).await;
        }
        ClientFrame::Read { chat_id, msg_id } => {
            publish_read_receipt(state, user_id, chat_id, msg_id).await;
        }
        ClientFrame::Typing { chat_id } => {
            publish_typing(state, user_id, chat_id).await;
        }
        ClientFrame::Ping { ts } => {
            let _ = send_frame(ws_tx, &ServerFrame::Pong { ts }).await;
        }
    }
}

async fn handle_send_message(
    state: &Arc<AppState>,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    user_id: UserId,
    device_id: &DeviceId,
    uuid: ClientUuid,
    chat_id: ChatId,
    body: String,
    media_url: Option<String>,
) {
    state.hub.subscribe(user_id, device_id.clone(), chat_id).await;
    state
        .delivery
        .ensure_subscribed(chat_id, state.shutdown.clone())
        .await;

    if body.trim().is_empty() {
        let _ = send_frame(
            ws_tx,
            &ServerFrame::Error {
                code: ErrorCode::Validation,
                uuid: Some(uuid),
                message: "body must not be empty".to_string(),
            },
        )
        .await;
        return;
    }

    let code = match state
        .ingress
        .publish(uuid, chat_id, user_id, body, media_url)
        .await
    {
        Ok(()) => return,
        Err(crate::ingress::IngressError::Timeout) => ErrorCode::PersistTransient,
        Err(crate::ingress::IngressError::Nacked) => ErrorCode::PublishFailed,
        Err(crate::ingress::IngressError::Unserializable) => ErrorCode::Validation,
    };
    let _ = send_frame(
        ws_tx,
        &ServerFrame::Error {
            code,
            uuid: Some(uuid),
            message: "message was not accepted".to_string(),
        },
    )
    .await;
}

async fn publish_read_receipt(state: &Arc<AppState>, user_id: UserId, chat_id: ChatId, msg_id: i64) {
    let event = ReadReceiptEvent { chat_id, user_id, msg_id };
    let Ok(payload) = serde_json::to_vec(&event) else {
        return;
    };
    if let Err(e) = state.nats.publish(READ_RECEIPTS_SUBJECT, payload.into()).await {
        warn!(%user_id, %chat_id, error = %e, "failed to publish read receipt");
    }
}

async fn publish_typing(state: &Arc<AppState>, user_id: UserId, chat_id: ChatId) {
    // Typing indicators are best-effort and never durable (§4.8), but
    // still cross-replica: they ride the same delivery subject as
    // messages and read receipts so every replica's delivery consumer
    // fans them out to its own locally-connected sessions.
    let envelope = DeliveryEnvelope::Typing { chat_id, user_id };
    let Ok(payload) = serde_json::to_vec(&envelope) else {
        return;
    };
    if let Err(e) = state.nats.publish(delivery_subject(chat_id), payload.into()).await {
        warn!(%user_id, %chat_id, error = %e, "failed to publish typing event");
    }
}

async fn send_frame(
    tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), ()> {
    tx.send(Message::Text(frame.to_json().into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
