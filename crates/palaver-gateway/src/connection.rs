//! One task per live WebSocket connection.
//!
//! Lifecycle: CONNECTING (room lookup, identity already resolved at the
//! upgrade) -> OPEN (registry join, presence, inbound frame loop) -> CLOSED
//! (teardown). The split-socket send/recv tasks are joined by a select! that
//! aborts the survivor, so teardown runs exactly once whether the client
//! closed cleanly, vanished mid-write, or was kicked.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use axum::extract::ws::{Message, WebSocket};

use palaver_types::events::{ClientFrame, FrameDecode, RoomEvent};

use crate::Gateway;
use crate::registry::{Identity, Outbound, RoomMember};

/// Drive a WebSocket connection for one room until it closes.
pub async fn handle_socket(
    socket: WebSocket,
    gateway: Gateway,
    room_id: Uuid,
    identity: Option<Identity>,
) {
    // CONNECTING: the room must exist; an unknown room is fatal to the session.
    let db = gateway.db.clone();
    let room_key = room_id.to_string();
    let room = tokio::task::spawn_blocking(move || db.get_room(&room_key)).await;
    match room {
        Ok(Ok(Some(_))) => {}
        Ok(Ok(None)) => {
            warn!(room = %room_id, "connection to unknown room refused");
            return;
        }
        Ok(Err(e)) => {
            warn!(room = %room_id, "room lookup failed: {}", e);
            return;
        }
        Err(e) => {
            warn!(room = %room_id, "room lookup task failed: {}", e);
            return;
        }
    }

    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let (sender, receiver) = socket.split();

    match &identity {
        Some(id) => info!("{} ({}) connected to room {}", id.username, id.user_id, room_id),
        None => info!("anonymous connection {} observing room {}", conn_id, room_id),
    }

    // OPEN: visible to fan-out from here on.
    gateway.registry.join(
        room_id,
        RoomMember {
            conn_id,
            identity: identity.clone(),
            tx,
        },
    );

    if let Some(id) = &identity {
        if let Err(e) = gateway.presence.set_online(id.user_id, &id.username, true).await {
            warn!("presence online update failed for {}: {}", id.user_id, e);
        }
        gateway.fanout.publish(
            room_id,
            &RoomEvent::UserJoin {
                user_id: id.user_id,
                username: id.username.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    let mut send_task = tokio::spawn(run_send_loop(sender, rx));

    let recv_gateway = gateway.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        run_recv_loop(receiver, recv_gateway, room_id, conn_id, recv_identity).await;
    });

    // Whichever side ends first takes the other down with it.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // CLOSED
    teardown(&gateway, room_id, conn_id, identity.as_ref()).await;

    match &identity {
        Some(id) => info!("{} ({}) disconnected from room {}", id.username, id.user_id, room_id),
        None => info!("anonymous connection {} left room {}", conn_id, room_id),
    }
}

async fn run_send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Event(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode outbound event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn run_recv_loop(
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    room_id: Uuid,
    conn_id: Uuid,
    identity: Option<Identity>,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match ClientFrame::decode(&text) {
                Ok(FrameDecode::Frame(frame)) => {
                    handle_frame(&gateway, room_id, conn_id, identity.as_ref(), frame).await;
                }
                // Forward compatibility: unrecognized frame types pass by.
                Ok(FrameDecode::Ignored) => {}
                Err(e) => {
                    warn!(
                        conn = %conn_id,
                        "malformed frame, closing: {} -- raw: {}",
                        e,
                        frame_preview(&text)
                    );
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_frame(
    gateway: &Gateway,
    room_id: Uuid,
    conn_id: Uuid,
    identity: Option<&Identity>,
    frame: ClientFrame,
) {
    // Anonymous sessions observe only; their frames carry no identity to act on.
    let Some(id) = identity else {
        return;
    };

    match frame {
        ClientFrame::ChatMessage { content, parent_id } => {
            let result = gateway
                .pipeline
                .submit(room_id, id.user_id, &id.username, &content, parent_id)
                .await;
            if let Err(e) = result {
                warn!("{} ({}) message rejected: {}", id.username, id.user_id, e);
                gateway.fanout.send_to(
                    room_id,
                    conn_id,
                    RoomEvent::Error {
                        code: error_code(&e).to_string(),
                        message: e.to_string(),
                    },
                );
            }
        }
        ClientFrame::Typing { is_typing } => {
            gateway
                .pipeline
                .submit_typing(room_id, id.user_id, &id.username, is_typing);
        }
    }
}

/// First ~200 bytes of a frame for logging, cut on a char boundary so a
/// multi-byte character straddling the limit can't panic the slice.
fn frame_preview(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn error_code(e: &crate::pipeline::ChatError) -> &'static str {
    use crate::pipeline::ChatError;
    match e {
        ChatError::EmptyMessage => "empty_message",
        ChatError::RoomNotFound(_) => "room_not_found",
        ChatError::Storage(_) => "storage",
    }
}

/// The OPEN -> CLOSED transition. Idempotent: side effects run only when this
/// call actually removed the connection from the registry, so running it a
/// second time is a safe no-op.
pub async fn teardown(
    gateway: &Gateway,
    room_id: Uuid,
    conn_id: Uuid,
    identity: Option<&Identity>,
) {
    if !gateway.registry.leave(room_id, conn_id) {
        return;
    }

    if let Some(id) = identity {
        if let Err(e) = gateway.presence.set_online(id.user_id, &id.username, false).await {
            warn!("presence offline update failed for {}: {}", id.user_id, e);
        }
        gateway.fanout.publish(
            room_id,
            &RoomEvent::UserLeave {
                user_id: id.user_id,
                username: id.username.clone(),
                timestamp: Utc::now(),
            },
        );
    }
}
