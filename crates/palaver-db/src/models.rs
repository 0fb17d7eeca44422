//! Database row types — these map directly to SQLite rows.
//! Distinct from the palaver-types API models to keep the DB layer independent.

use chrono::{DateTime, Utc};
use tracing::warn;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub creator_id: String,
    pub is_private: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub created_at: String,
    pub is_read: bool,
    pub parent_id: Option<String>,
}

pub struct ProfileRow {
    pub user_id: String,
    pub username: String,
    pub online: bool,
    pub last_seen: String,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub is_read: bool,
    pub created_at: String,
}

/// Parse a stored timestamp. Rows written by this crate are RFC 3339; SQLite's
/// `datetime('now')` column defaults are naive `YYYY-MM-DD HH:MM:SS` UTC.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}
