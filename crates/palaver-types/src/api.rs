use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Room};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket upgrade path.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
}

/// Returned when a client opens a room: history, with this reader's pending
/// notifications for the room already flipped to read.
#[derive(Debug, Serialize)]
pub struct OpenRoomResponse {
    pub room: Room,
    pub messages: Vec<Message>,
}

// -- Presence --

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: Uuid,
    pub username: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub online_users: Vec<OnlineUser>,
}
