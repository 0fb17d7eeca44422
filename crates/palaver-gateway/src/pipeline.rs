//! Validate, persist, notify, fan out.
//!
//! The persistence leg (message insert, room timestamp bump, per-recipient
//! notifications) is one transaction; the fan-out leg stays best-effort and
//! runs only after the commit, so a storage failure never produces a
//! broadcast for a message that doesn't exist.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use palaver_db::Database;
use palaver_db::queries::{NewMessage, NewNotification};
use palaver_types::events::RoomEvent;

use crate::fanout::Fanout;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message content must not be empty")]
    EmptyMessage,

    #[error("room not found: {0}")]
    RoomNotFound(Uuid),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

/// What a successful submission looks like to the caller.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct MessagePipeline {
    db: Arc<Database>,
    fanout: Fanout,
}

impl MessagePipeline {
    pub fn new(db: Arc<Database>, fanout: Fanout) -> Self {
        Self { db, fanout }
    }

    /// Submit a chat message to a room on behalf of an authenticated sender.
    ///
    /// A `parent_id` that doesn't resolve — or that resolves to a message in
    /// a different room — is dropped rather than failing the submission, so
    /// a reply to a just-deleted message still lands as a plain message.
    pub async fn submit(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        sender_username: &str,
        content: &str,
        parent_id: Option<Uuid>,
    ) -> Result<MessageRecord, ChatError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message_id = Uuid::new_v4();
        let timestamp = Utc::now();

        let db = self.db.clone();
        let persisted_content = content.clone();
        let record = tokio::task::spawn_blocking(move || {
            persist(
                &db,
                room_id,
                sender_id,
                message_id,
                timestamp,
                persisted_content,
                parent_id,
            )
        })
        .await
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("persist task failed: {}", e)))??;

        debug!(room = %room_id, message = %message_id, "message persisted");

        self.fanout.publish(
            room_id,
            &RoomEvent::ChatMessage {
                message_id,
                sender_id,
                sender_username: sender_username.to_string(),
                content,
                timestamp,
                parent_id: record.parent_id,
            },
        );

        Ok(record)
    }

    /// Relay a typing indicator. Ephemeral: straight to fan-out, no storage.
    pub fn submit_typing(&self, room_id: Uuid, user_id: Uuid, username: &str, is_typing: bool) {
        self.fanout.publish(
            room_id,
            &RoomEvent::Typing {
                user_id,
                username: username.to_string(),
                is_typing,
            },
        );
    }
}

fn persist(
    db: &Database,
    room_id: Uuid,
    sender_id: Uuid,
    message_id: Uuid,
    timestamp: DateTime<Utc>,
    content: String,
    parent_id: Option<Uuid>,
) -> Result<MessageRecord, ChatError> {
    let room_key = room_id.to_string();
    db.get_room(&room_key)?
        .ok_or(ChatError::RoomNotFound(room_id))?;

    // Lenient threading: a parent must exist and live in the same room,
    // otherwise the reply degrades to a top-level message.
    let parent_id = match parent_id {
        Some(pid) => db
            .get_message(&pid.to_string())?
            .filter(|parent| parent.room_id == room_key)
            .map(|_| pid),
        None => None,
    };

    let sender_key = sender_id.to_string();
    let notifications: Vec<NewNotification> = db
        .room_participants(&room_key)?
        .into_iter()
        .filter(|uid| *uid != sender_key)
        .map(|uid| NewNotification {
            id: Uuid::new_v4().to_string(),
            user_id: uid,
        })
        .collect();

    let msg = NewMessage {
        id: message_id.to_string(),
        room_id: room_key,
        sender_id: sender_key,
        content,
        parent_id: parent_id.map(|p| p.to_string()),
        created_at: timestamp,
    };
    db.record_message(&msg, &notifications)?;

    Ok(MessageRecord {
        message_id,
        timestamp,
        parent_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbound, RoomMember, RoomRegistry};
    use tokio::sync::mpsc;

    struct Fixture {
        db: Arc<Database>,
        registry: Arc<RoomRegistry>,
        pipeline: MessagePipeline,
        room: Uuid,
        alice: Uuid,
        bob: Uuid,
        carol: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(RoomRegistry::new());
        let pipeline = MessagePipeline::new(db.clone(), Fanout::new(registry.clone()));

        let (room, alice, bob, carol) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.create_user(&alice.to_string(), "alice").unwrap();
        db.create_user(&bob.to_string(), "bob").unwrap();
        db.create_user(&carol.to_string(), "carol").unwrap();
        db.create_room(&room.to_string(), "general", "", &alice.to_string(), false)
            .unwrap();
        db.add_participant(&room.to_string(), &bob.to_string()).unwrap();
        db.add_participant(&room.to_string(), &carol.to_string()).unwrap();

        Fixture {
            db,
            registry,
            pipeline,
            room,
            alice,
            bob,
            carol,
        }
    }

    fn join_session(fx: &Fixture) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.registry.join(
            fx.room,
            RoomMember {
                conn_id: Uuid::new_v4(),
                identity: None,
                tx,
            },
        );
        rx
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(Outbound::Event(event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn submit_persists_notifies_and_fans_out() {
        let fx = fixture();
        // Two sessions in the room, one of them the sender's own
        let mut rx1 = join_session(&fx);
        let mut rx2 = join_session(&fx);

        let record = fx
            .pipeline
            .submit(fx.room, fx.alice, "alice", "hello room", None)
            .await
            .unwrap();

        // Exactly one persisted message
        let messages = fx.db.room_messages(&fx.room.to_string()).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, record.message_id.to_string());

        // Notifications for bob and carol, none for the sender
        assert_eq!(fx.db.unread_notifications(&fx.bob.to_string()).unwrap().len(), 1);
        assert_eq!(fx.db.unread_notifications(&fx.carol.to_string()).unwrap().len(), 1);
        assert!(fx.db.unread_notifications(&fx.alice.to_string()).unwrap().is_empty());

        // Broadcast to every joined session, sender's included
        for rx in [&mut rx1, &mut rx2] {
            let events = drain_events(rx);
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], RoomEvent::ChatMessage { message_id, .. }
                if message_id == record.message_id));
        }
    }

    #[tokio::test]
    async fn empty_and_whitespace_content_rejected_with_zero_writes() {
        let fx = fixture();
        let mut rx = join_session(&fx);

        for bad in ["", "   ", "\n\t "] {
            let err = fx
                .pipeline
                .submit(fx.room, fx.alice, "alice", bad, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::EmptyMessage));
        }

        assert!(fx.db.room_messages(&fx.room.to_string()).unwrap().is_empty());
        assert!(fx.db.unread_notifications(&fx.bob.to_string()).unwrap().is_empty());
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_room_is_rejected() {
        let fx = fixture();
        let err = fx
            .pipeline
            .submit(Uuid::new_v4(), fx.alice, "alice", "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn nonexistent_parent_degrades_to_top_level() {
        let fx = fixture();
        let mut rx = join_session(&fx);

        let record = fx
            .pipeline
            .submit(fx.room, fx.alice, "alice", "reply", Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(record.parent_id, None);

        let stored = fx
            .db
            .get_message(&record.message_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent_id, None);

        // Still broadcast normally
        assert_eq!(drain_events(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn parent_from_another_room_is_dropped() {
        let fx = fixture();
        let other_room = Uuid::new_v4();
        fx.db
            .create_room(&other_room.to_string(), "other", "", &fx.alice.to_string(), false)
            .unwrap();
        let foreign = fx
            .pipeline
            .submit(other_room, fx.alice, "alice", "elsewhere", None)
            .await
            .unwrap();

        let record = fx
            .pipeline
            .submit(fx.room, fx.alice, "alice", "reply", Some(foreign.message_id))
            .await
            .unwrap();
        assert_eq!(record.parent_id, None);
    }

    #[tokio::test]
    async fn resolved_parent_is_kept() {
        let fx = fixture();
        let first = fx
            .pipeline
            .submit(fx.room, fx.alice, "alice", "root", None)
            .await
            .unwrap();
        let reply = fx
            .pipeline
            .submit(fx.room, fx.bob, "bob", "reply", Some(first.message_id))
            .await
            .unwrap();
        assert_eq!(reply.parent_id, Some(first.message_id));
    }

    #[tokio::test]
    async fn typing_relays_without_touching_storage() {
        let fx = fixture();
        let mut rx = join_session(&fx);

        fx.pipeline.submit_typing(fx.room, fx.bob, "bob", true);

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RoomEvent::Typing { is_typing: true, .. }));

        assert!(fx.db.room_messages(&fx.room.to_string()).unwrap().is_empty());
        assert!(fx.db.unread_notifications(&fx.bob.to_string()).unwrap().is_empty());
    }
}
