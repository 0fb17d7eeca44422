//! Room-scoped event delivery.
//!
//! Publishing snapshots the room's membership and pushes the event onto
//! every member's outbound queue; each connection's send task encodes and
//! writes at its own pace. Queues decouple the fan-out from socket speed: a
//! stalled client delays nobody. A push that fails means the receiving task
//! is gone, so the member is evicted from the registry instead of the
//! failure reaching the publisher.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use palaver_types::events::RoomEvent;

use crate::registry::{Outbound, RoomRegistry};

#[derive(Clone)]
pub struct Fanout {
    registry: Arc<RoomRegistry>,
}

impl Fanout {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver an event to every connection currently in the room, including
    /// the sender's own sessions. Returns the number of queues reached.
    pub fn publish(&self, room_id: Uuid, event: &RoomEvent) -> usize {
        let members = self.registry.members(room_id);
        let mut delivered = 0;
        for member in members {
            if member.tx.send(Outbound::Event(event.clone())).is_ok() {
                delivered += 1;
            } else {
                warn!(room = %room_id, conn = %member.conn_id, "dead outbound queue, evicting");
                self.registry.leave(room_id, member.conn_id);
            }
        }
        debug!(room = %room_id, delivered, "published event");
        delivered
    }

    /// Deliver an event to one connection only. Used for failure acks.
    pub fn send_to(&self, room_id: Uuid, conn_id: Uuid, event: RoomEvent) {
        for member in self.registry.members(room_id) {
            if member.conn_id == conn_id {
                if member.tx.send(Outbound::Event(event)).is_err() {
                    self.registry.leave(room_id, conn_id);
                }
                return;
            }
        }
    }

    /// External teardown: ask a connection's send task to close its socket.
    /// Never blocks; the session runs its normal CLOSED transition.
    pub fn kick(&self, room_id: Uuid, conn_id: Uuid) -> bool {
        for member in self.registry.members(room_id) {
            if member.conn_id == conn_id {
                if member.tx.send(Outbound::Close).is_err() {
                    self.registry.leave(room_id, conn_id);
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoomMember;
    use tokio::sync::mpsc;

    fn join(registry: &RoomRegistry, room: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.join(
            room,
            RoomMember {
                conn_id,
                identity: None,
                tx,
            },
        );
        (conn_id, rx)
    }

    fn typing_event() -> RoomEvent {
        RoomEvent::Typing {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_member() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let room = Uuid::new_v4();

        let (_, mut rx1) = join(&registry, room);
        let (_, mut rx2) = join(&registry, room);

        let delivered = fanout.publish(room, &typing_event());
        assert_eq!(delivered, 2);
        assert!(matches!(rx1.try_recv(), Ok(Outbound::Event(_))));
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Event(_))));
    }

    #[tokio::test]
    async fn dead_member_is_evicted_without_aborting_delivery() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let room = Uuid::new_v4();

        let (_, rx_dead) = join(&registry, room);
        let (_, mut rx_live) = join(&registry, room);
        drop(rx_dead); // simulated broken pipe

        let delivered = fanout.publish(room, &typing_event());
        assert_eq!(delivered, 1);
        assert!(matches!(rx_live.try_recv(), Ok(Outbound::Event(_))));
        assert_eq!(registry.member_count(room), 1);
    }

    #[tokio::test]
    async fn send_to_targets_one_connection() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let room = Uuid::new_v4();

        let (conn1, mut rx1) = join(&registry, room);
        let (_, mut rx2) = join(&registry, room);

        fanout.send_to(
            room,
            conn1,
            RoomEvent::Error {
                code: "storage".into(),
                message: "submission failed".into(),
            },
        );
        assert!(matches!(rx1.try_recv(), Ok(Outbound::Event(RoomEvent::Error { .. }))));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn kick_queues_a_close() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let room = Uuid::new_v4();

        let (conn, mut rx) = join(&registry, room);
        assert!(fanout.kick(room, conn));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(!fanout.kick(room, Uuid::new_v4()));
    }
}
