use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use palaver_types::api::Claims;

use crate::AppState;

/// Flip one notification to read. Scoped to the caller; flipping someone
/// else's notification is indistinguishable from a missing one.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let nid = notification_id.to_string();
    let uid = claims.sub.to_string();

    let flipped = tokio::task::spawn_blocking(move || db.mark_notification_read(&nid, &uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("notification flip failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !flipped {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(json!({ "success": true })))
}
