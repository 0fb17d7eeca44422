//! Per-room membership of live connections.
//!
//! Soft state: nothing here survives a restart; membership is rebuilt from
//! live connections. The map is sharded by room so independent rooms never
//! contend on a common lock.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use palaver_types::events::RoomEvent;

/// Authenticated identity attached to a connection. Absent for anonymous
/// (read-only) sessions.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// What a connection's send task pulls off its outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(RoomEvent),
    /// Ask the send task to close the socket. Used for external teardown.
    Close,
}

/// Non-owning membership entry for one live connection. The connection task
/// owns the socket; the registry holds only the conn id, the identity, and
/// the sending half of the connection's outbound queue.
#[derive(Clone)]
pub struct RoomMember {
    pub conn_id: Uuid,
    pub identity: Option<Identity>,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<Uuid, HashMap<Uuid, RoomMember>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room entry if absent.
    pub fn join(&self, room_id: Uuid, member: RoomMember) {
        let conn_id = member.conn_id;
        let mut entry = self.rooms.entry(room_id).or_default();
        entry.insert(conn_id, member);
        debug!(room = %room_id, conn = %conn_id, members = entry.len(), "joined room");
    }

    /// Remove a connection from a room. Removing an absent connection is a
    /// silent no-op; returns whether anything was actually removed.
    pub fn leave(&self, room_id: Uuid, conn_id: Uuid) -> bool {
        let mut removed = false;
        let mut emptied = false;
        if let Some(mut entry) = self.rooms.get_mut(&room_id) {
            removed = entry.remove(&conn_id).is_some();
            emptied = entry.is_empty();
        }
        if emptied {
            // Re-checked under the shard lock: a concurrent join wins.
            self.rooms.remove_if(&room_id, |_, members| members.is_empty());
        }
        if removed {
            debug!(room = %room_id, conn = %conn_id, "left room");
        }
        removed
    }

    /// Snapshot of the room's current members. A plain Vec, never a live
    /// view, so callers can iterate while joins and leaves proceed.
    pub fn members(&self, room_id: Uuid) -> Vec<RoomMember> {
        self.rooms
            .get(&room_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map(|e| e.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
