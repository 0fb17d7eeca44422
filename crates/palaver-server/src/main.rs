use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use palaver_api::middleware::require_auth;
use palaver_api::{AppState, AppStateInner, messages, notifications, rooms, users};
use palaver_gateway::Gateway;
use palaver_gateway::connection;
use palaver_gateway::registry::Identity;
use palaver_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palaver=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PALAVER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PALAVER_DB_PATH").unwrap_or_else(|_| "palaver.db".into());
    let host = std::env::var("PALAVER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PALAVER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(palaver_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let gateway = Gateway::new(db.clone());
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        pipeline: gateway.pipeline.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        gateway,
        jwt_secret,
    };

    // Routes
    let protected_routes = Router::new()
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{room_id}/open", post(rooms::open_room))
        .route("/rooms/{room_id}/messages", post(messages::send_message))
        .route("/users/online", get(users::online_users))
        .route("/notifications/{notification_id}/read", post(notifications::mark_read))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/ws/rooms/{room_id}", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Palaver server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket entry point. The token is optional: a missing or invalid token
/// yields an anonymous read-only session rather than a rejection.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = query
        .token
        .as_deref()
        .and_then(|token| decode_identity(token, &state.jwt_secret));

    ws.on_upgrade(move |socket| {
        connection::handle_socket(socket, state.gateway, room_id, identity)
    })
}

fn decode_identity(token: &str, secret: &str) -> Option<Identity> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Some(Identity {
        user_id: token_data.claims.sub,
        username: token_data.claims.username,
    })
}
