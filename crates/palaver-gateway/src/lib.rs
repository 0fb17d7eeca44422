pub mod connection;
pub mod fanout;
pub mod pipeline;
pub mod presence;
pub mod registry;

use std::sync::Arc;

use palaver_db::Database;

use crate::fanout::Fanout;
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceTracker;
use crate::registry::RoomRegistry;

/// The realtime core, assembled once at startup and shared by every
/// connection task and by the HTTP action layer.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub registry: Arc<RoomRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub fanout: Fanout,
    pub pipeline: MessagePipeline,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let presence = Arc::new(PresenceTracker::new(db.clone()));
        let pipeline = MessagePipeline::new(db.clone(), fanout.clone());
        Self {
            db,
            registry,
            presence,
            fanout,
            pipeline,
        }
    }
}
