//! Online/offline tracking, written through to the durable profile.
//!
//! The in-memory map answers the hot "who's online" query; the profile row is
//! the durable record other surfaces read. A profile missing at update time
//! is created on the spot (upsert-on-miss), never an error.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use palaver_db::Database;

pub struct PresenceTracker {
    db: Arc<Database>,
    online: RwLock<HashMap<Uuid, String>>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            online: RwLock::new(HashMap::new()),
        }
    }

    /// Flip a user online or offline. The offline transition stamps
    /// last_seen with the current time; going online leaves it untouched.
    pub async fn set_online(&self, user_id: Uuid, username: &str, online: bool) -> Result<()> {
        {
            let mut map = self.online.write().await;
            if online {
                map.insert(user_id, username.to_string());
            } else {
                map.remove(&user_id);
            }
        }
        debug!(user = %user_id, online, "presence update");

        let last_seen = (!online).then(Utc::now);
        let db = self.db.clone();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || db.upsert_profile(&uid, online, last_seen))
            .await
            .map_err(|e| anyhow::anyhow!("profile upsert task failed: {}", e))??;
        Ok(())
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.online.read().await.contains_key(&user_id)
    }

    /// Who's online right now, excluding the asking user.
    pub async fn snapshot_online(&self, excluding: Option<Uuid>) -> Vec<(Uuid, String)> {
        self.online
            .read()
            .await
            .iter()
            .filter(|(id, _)| Some(**id) != excluding)
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }
}
