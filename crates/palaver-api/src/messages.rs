use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use palaver_gateway::pipeline::ChatError;
use palaver_types::api::{Claims, SendMessageRequest, SendMessageResponse};

use crate::AppState;

/// REST entry point into the message pipeline. Equivalent to posting a
/// `chat_message` frame on the room socket, for clients without a live
/// connection.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Only participants (the creator included) may post
    let db = state.db.clone();
    let rid = room_id.to_string();
    let (room, participants) = tokio::task::spawn_blocking(move || {
        let room = db.get_room(&rid)?;
        let participants = db.room_participants(&rid)?;
        Ok::<_, anyhow::Error>((room, participants))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("room lookup failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if room.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    if !participants.contains(&claims.sub.to_string()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let record = state
        .pipeline
        .submit(
            room_id,
            claims.sub,
            &claims.username,
            &req.content,
            req.parent_id,
        )
        .await
        .map_err(|e| match e {
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Storage(err) => {
                error!("message submission failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id: record.message_id,
            timestamp: record.timestamp,
        }),
    ))
}
