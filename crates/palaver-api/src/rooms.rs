use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, warn};
use uuid::Uuid;

use palaver_db::models::{MessageRow, RoomRow, parse_timestamp};
use palaver_types::api::{Claims, CreateRoomRequest, OpenRoomResponse};
use palaver_types::models::{Message, Room};

use crate::AppState;

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let room_id = Uuid::new_v4();
    let db = state.db.clone();
    let creator = claims.sub.to_string();
    let room = tokio::task::spawn_blocking(move || {
        db.create_room(
            &room_id.to_string(),
            &name,
            &req.description,
            &creator,
            req.is_private,
        )?;
        db.get_room(&room_id.to_string())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("room creation failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((StatusCode::CREATED, Json(room_to_model(room))))
}

/// Opening a room returns its history and flips the reader's pending
/// notifications for that room to read in the same action.
pub async fn open_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let rid = room_id.to_string();
    let uid = claims.sub.to_string();

    let (room, messages) = tokio::task::spawn_blocking(move || {
        let Some(room) = db.get_room(&rid)? else {
            return Ok(None);
        };

        if room.is_private {
            let participants = db.room_participants(&rid)?;
            if !participants.contains(&uid) {
                return Ok(Some((room, None)));
            }
        }

        db.mark_room_notifications_read(&uid, &rid)?;
        let messages = db.room_messages(&rid)?;
        Ok::<_, anyhow::Error>(Some((room, Some(messages))))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("room open failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .ok_or(StatusCode::NOT_FOUND)?;

    let Some(messages) = messages else {
        return Err(StatusCode::FORBIDDEN);
    };

    Ok(Json(OpenRoomResponse {
        room: room_to_model(room),
        messages: messages.into_iter().map(message_to_model).collect(),
    }))
}

fn parse_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub(crate) fn room_to_model(row: RoomRow) -> Room {
    Room {
        id: parse_id(&row.id, "room id"),
        name: row.name,
        description: row.description,
        creator_id: parse_id(&row.creator_id, "creator_id"),
        is_private: row.is_private,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }
}

pub(crate) fn message_to_model(row: MessageRow) -> Message {
    Message {
        id: parse_id(&row.id, "message id"),
        room_id: parse_id(&row.room_id, "room_id"),
        sender_id: parse_id(&row.sender_id, "sender_id"),
        sender_username: row.sender_username,
        content: row.content,
        created_at: parse_timestamp(&row.created_at),
        is_read: row.is_read,
        parent_id: row.parent_id.map(|p| parse_id(&p, "parent_id")),
    }
}
