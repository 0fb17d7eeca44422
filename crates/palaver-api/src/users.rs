use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::error;
use uuid::Uuid;

use palaver_db::models::parse_timestamp;
use palaver_types::api::{Claims, OnlineUser, OnlineUsersResponse};

use crate::AppState;

/// Who's online, excluding the caller. Read from the durable profiles so the
/// answer matches what the presence tracker wrote through.
pub async fn online_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let caller = claims.sub.to_string();
    let profiles = tokio::task::spawn_blocking(move || db.online_profiles(Some(&caller)))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("online profile query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let online_users = profiles
        .into_iter()
        .map(|p| OnlineUser {
            id: p.user_id.parse().unwrap_or_else(|_| Uuid::default()),
            username: p.username,
            last_seen: parse_timestamp(&p.last_seen),
        })
        .collect();

    Ok(Json(OnlineUsersResponse { online_users }))
}
