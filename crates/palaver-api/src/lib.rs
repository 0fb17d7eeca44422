pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod rooms;
pub mod users;

use std::sync::Arc;

use palaver_db::Database;
use palaver_gateway::pipeline::MessagePipeline;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub pipeline: MessagePipeline,
    pub jwt_secret: String,
}
