use crate::Database;
use crate::models::{MessageRow, NotificationRow, ProfileRow, RoomRow, UserRow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// A message about to be persisted, together with the notifications it fans
/// out to. `record_message` writes the whole thing in one transaction.
pub struct NewMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewNotification {
    pub id: String,
    pub user_id: String,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.prepare("SELECT id, username, created_at FROM users WHERE id = ?1")?
                .query_row([id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })
                .optional()
        })
    }

    // -- Rooms --

    pub fn create_room(
        &self,
        id: &str,
        name: &str,
        description: &str,
        creator_id: &str,
        is_private: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO rooms (id, name, description, creator_id, is_private, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![id, name, description, creator_id, is_private as i64, now],
            )?;
            Ok(())
        })
    }

    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    pub fn touch_room(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            touch_room(conn, id, Utc::now())?;
            Ok(())
        })
    }

    pub fn add_participant(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO room_participants (room_id, user_id) VALUES (?1, ?2)",
                (room_id, user_id),
            )?;
            Ok(())
        })
    }

    /// All user ids eligible to receive this room's messages. The creator is
    /// an implicit participant even when absent from the explicit set.
    pub fn room_participants(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM room_participants WHERE room_id = ?1
                 UNION
                 SELECT creator_id FROM rooms WHERE id = ?1",
            )?;
            let ids = stmt
                .query_map([room_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    // -- Messages --

    pub fn create_message(&self, msg: &NewMessage) -> Result<()> {
        self.with_conn(|conn| {
            insert_message(conn, msg)?;
            Ok(())
        })
    }

    /// Persist a message, bump the room's updated_at, and insert one
    /// notification per recipient — atomically.
    pub fn record_message(&self, msg: &NewMessage, notifications: &[NewNotification]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_message(&tx, msg)?;
            touch_room(&tx, &msg.room_id, msg.created_at)?;
            for n in notifications {
                tx.execute(
                    "INSERT INTO notifications (id, user_id, message_id, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![n.id, n.user_id, msg.id, msg.created_at.to_rfc3339()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT m.id, m.room_id, m.sender_id, u.username, m.content,
                        m.created_at, m.is_read, m.parent_id
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.id = ?1",
            )?
            .query_row([id], message_from_row)
            .optional()
        })
    }

    pub fn room_messages(&self, room_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.room_id, m.sender_id, u.username, m.content,
                        m.created_at, m.is_read, m.parent_id
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.room_id = ?1
                 ORDER BY m.created_at",
            )?;
            let rows = stmt
                .query_map([room_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Profiles --

    /// Idempotent upsert: a missing profile row is created rather than being
    /// an error. `last_seen` is only rewritten when a stamp is supplied
    /// (the offline transition).
    pub fn upsert_profile(
        &self,
        user_id: &str,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let stamp = last_seen.map(|t| t.to_rfc3339());
            conn.execute(
                "INSERT INTO profiles (user_id, online, last_seen)
                 VALUES (?1, ?2, COALESCE(?3, ?4))
                 ON CONFLICT(user_id) DO UPDATE SET
                     online = excluded.online,
                     last_seen = COALESCE(?3, profiles.last_seen)",
                rusqlite::params![user_id, online as i64, stamp, now],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT p.user_id, u.username, p.online, p.last_seen
                 FROM profiles p
                 LEFT JOIN users u ON p.user_id = u.id
                 WHERE p.user_id = ?1",
            )?
            .query_row([user_id], profile_from_row)
            .optional()
        })
    }

    pub fn online_profiles(&self, excluding: Option<&str>) -> Result<Vec<ProfileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.user_id, u.username, p.online, p.last_seen
                 FROM profiles p
                 LEFT JOIN users u ON p.user_id = u.id
                 WHERE p.online = 1 AND p.user_id != COALESCE(?1, '')",
            )?;
            let rows = stmt
                .query_map([excluding], profile_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Notifications --

    pub fn create_notification(&self, id: &str, user_id: &str, message_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, user_id, message_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Flip one notification to read. Scoped to the owning user; returns
    /// whether a row was actually flipped.
    pub fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            Ok(affected > 0)
        })
    }

    /// Bulk flip: everything pending for this user in this room, when the
    /// user opens the room. Returns the number of rows flipped.
    pub fn mark_room_notifications_read(&self, user_id: &str, room_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE notifications SET is_read = 1
                 WHERE user_id = ?1 AND is_read = 0
                   AND message_id IN (SELECT id FROM messages WHERE room_id = ?2)",
                (user_id, room_id),
            )?;
            Ok(affected)
        })
    }

    pub fn unread_notifications(&self, user_id: &str) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, message_id, is_read, created_at
                 FROM notifications
                 WHERE user_id = ?1 AND is_read = 0
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        message_id: row.get(2)?,
                        is_read: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn insert_message(conn: &Connection, msg: &NewMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, room_id, sender_id, content, created_at, parent_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            msg.id,
            msg.room_id,
            msg.sender_id,
            msg.content,
            msg.created_at.to_rfc3339(),
            msg.parent_id,
        ],
    )?;
    Ok(())
}

fn touch_room(conn: &Connection, room_id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET updated_at = ?1 WHERE id = ?2",
        (at.to_rfc3339(), room_id),
    )?;
    Ok(())
}

fn query_room(conn: &Connection, id: &str) -> Result<Option<RoomRow>> {
    conn.prepare(
        "SELECT id, name, description, creator_id, is_private, created_at, updated_at
         FROM rooms WHERE id = ?1",
    )?
    .query_row([id], |row| {
        Ok(RoomRow {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            creator_id: row.get(3)?,
            is_private: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    })
    .optional()
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        created_at: row.get(5)?,
        is_read: row.get(6)?,
        parent_id: row.get(7)?,
    })
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        user_id: row.get(0)?,
        username: row
            .get::<_, Option<String>>(1)?
            .unwrap_or_else(|| "unknown".to_string()),
        online: row.get(2)?,
        last_seen: row.get(3)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn seed_room(db: &Database) -> (String, String, String) {
        let creator = Uuid::new_v4().to_string();
        let member = Uuid::new_v4().to_string();
        let room = Uuid::new_v4().to_string();
        db.create_user(&creator, "alice").unwrap();
        db.create_user(&member, "bob").unwrap();
        db.create_room(&room, "general", "", &creator, false).unwrap();
        db.add_participant(&room, &member).unwrap();
        (room, creator, member)
    }

    fn new_message(room: &str, sender: &str, content: &str) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room.to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn creator_is_implicit_participant() {
        let db = Database::open_in_memory().unwrap();
        let (room, creator, member) = seed_room(&db);

        let participants = db.room_participants(&room).unwrap();
        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&creator));
        assert!(participants.contains(&member));
    }

    #[test]
    fn record_message_bumps_room_and_notifies() {
        let db = Database::open_in_memory().unwrap();
        let (room, creator, member) = seed_room(&db);
        let before = db.get_room(&room).unwrap().unwrap().updated_at;

        let msg = new_message(&room, &creator, "hello");
        let notif = NewNotification {
            id: Uuid::new_v4().to_string(),
            user_id: member.clone(),
        };
        db.record_message(&msg, &[notif]).unwrap();

        let stored = db.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.sender_username, "alice");

        let after = db.get_room(&room).unwrap().unwrap().updated_at;
        assert_ne!(before, after);

        assert_eq!(db.unread_notifications(&member).unwrap().len(), 1);
        assert_eq!(db.unread_notifications(&creator).unwrap().len(), 0);
    }

    #[test]
    fn upsert_profile_creates_on_miss_and_stamps_offline() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4().to_string();
        db.create_user(&user, "carol").unwrap();

        // No profile row yet — upsert must create one
        db.upsert_profile(&user, true, None).unwrap();
        let profile = db.get_profile(&user).unwrap().unwrap();
        assert!(profile.online);
        let seen_while_online = profile.last_seen.clone();

        // Going online again must not rewrite last_seen
        db.upsert_profile(&user, true, None).unwrap();
        assert_eq!(db.get_profile(&user).unwrap().unwrap().last_seen, seen_while_online);

        // Offline transition carries a fresh stamp
        let stamp = Utc::now() + chrono::Duration::seconds(5);
        db.upsert_profile(&user, false, Some(stamp)).unwrap();
        let profile = db.get_profile(&user).unwrap().unwrap();
        assert!(!profile.online);
        assert_eq!(profile.last_seen, stamp.to_rfc3339());
    }

    #[test]
    fn online_profiles_excludes_caller() {
        let db = Database::open_in_memory().unwrap();
        let (_, creator, member) = seed_room(&db);
        db.upsert_profile(&creator, true, None).unwrap();
        db.upsert_profile(&member, true, None).unwrap();

        let online = db.online_profiles(Some(&creator)).unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, member);
    }

    #[test]
    fn opening_a_room_flips_pending_notifications() {
        let db = Database::open_in_memory().unwrap();
        let (room, creator, member) = seed_room(&db);

        for content in ["one", "two"] {
            let msg = new_message(&room, &creator, content);
            let notif = NewNotification {
                id: Uuid::new_v4().to_string(),
                user_id: member.clone(),
            };
            db.record_message(&msg, &[notif]).unwrap();
        }
        assert_eq!(db.unread_notifications(&member).unwrap().len(), 2);

        let flipped = db.mark_room_notifications_read(&member, &room).unwrap();
        assert_eq!(flipped, 2);
        assert!(db.unread_notifications(&member).unwrap().is_empty());
    }

    #[test]
    fn mark_notification_read_is_scoped_to_owner() {
        let db = Database::open_in_memory().unwrap();
        let (room, creator, member) = seed_room(&db);

        let msg = new_message(&room, &creator, "hi");
        let notif_id = Uuid::new_v4().to_string();
        db.record_message(
            &msg,
            &[NewNotification {
                id: notif_id.clone(),
                user_id: member.clone(),
            }],
        )
        .unwrap();

        // Someone else cannot flip bob's notification
        assert!(!db.mark_notification_read(&notif_id, &creator).unwrap());
        assert!(db.mark_notification_read(&notif_id, &member).unwrap());
    }

    #[test]
    fn room_messages_in_order() {
        let db = Database::open_in_memory().unwrap();
        let (room, creator, _) = seed_room(&db);

        for (i, content) in ["first", "second"].iter().enumerate() {
            let mut msg = new_message(&room, &creator, content);
            msg.created_at = Utc::now() + chrono::Duration::seconds(i as i64);
            db.create_message(&msg).unwrap();
        }

        let messages = db.room_messages(&room).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }
}
