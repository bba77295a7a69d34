use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, trace};
use uuid::Uuid;

use mitra_types::events::ServerEvent;

/// Socket connection id. A user may hold several connections.
pub type ConnId = Uuid;

/// Broadcast group. Chat and attendance channels of the same event are
/// separate rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Chat(Uuid),
    Attendance(Uuid),
}

impl RoomKey {
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::Chat(id) | Self::Attendance(id) => *id,
        }
    }
}

struct ConnEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<Arc<str>>,
}

/// In-memory room broker. Frames are serialized once per broadcast and
/// handed to each member's outbound channel.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connections: RwLock<HashMap<ConnId, ConnEntry>>,

    /// Members per room. A room is present only while non-empty.
    rooms: RwLock<HashMap<RoomKey, HashSet<ConnId>>>,

    /// Who is typing: event_id -> (conn_id -> user_id)
    typing: RwLock<HashMap<Uuid, HashMap<ConnId, Uuid>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                typing: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. The receiver yields pre-serialized frames.
    pub async fn register(&self, user_id: Uuid) -> (ConnId, mpsc::UnboundedReceiver<Arc<str>>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnEntry { user_id, tx });
        (conn_id, rx)
    }

    /// Idempotent. Returns true if the connection was not yet a member.
    pub async fn join(&self, room: RoomKey, conn_id: ConnId) -> bool {
        if !self.inner.connections.read().await.contains_key(&conn_id) {
            return false;
        }
        self.inner
            .rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(conn_id)
    }

    /// Idempotent, safe without a prior join. Leaving a chat room ends the
    /// connection's typing state there.
    pub async fn leave(&self, room: RoomKey, conn_id: ConnId) -> bool {
        let removed = {
            let mut rooms = self.inner.rooms.write().await;
            match rooms.get_mut(&room) {
                Some(members) => {
                    let removed = members.remove(&conn_id);
                    if members.is_empty() {
                        rooms.remove(&room);
                    }
                    removed
                }
                None => false,
            }
        };

        if let RoomKey::Chat(event_id) = room {
            self.stop_typing(event_id, conn_id).await;
        }
        removed
    }

    pub async fn is_member(&self, room: RoomKey, conn_id: ConnId) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Deliver to every member of `room` except `except`.
    pub async fn broadcast(&self, room: RoomKey, event: &ServerEvent, except: Option<ConnId>) {
        let Some(frame) = encode(event) else {
            return;
        };

        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&room) else {
            trace!("No members in {:?} for {}", room, event.name());
            return;
        };
        let connections = self.inner.connections.read().await;

        let mut delivered = 0usize;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(entry) = connections.get(conn_id) {
                if entry.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!("{} -> {:?} ({} recipients)", event.name(), room, delivered);
    }

    /// Send to a single connection, e.g. `ready` or a per-action `error`.
    pub async fn send_to(&self, conn_id: ConnId, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        if let Some(entry) = self.inner.connections.read().await.get(&conn_id) {
            let _ = entry.tx.send(frame);
        }
    }

    // -- Typing --

    /// Record that this connection's user is typing in an event chat.
    pub async fn start_typing(&self, event_id: Uuid, conn_id: ConnId, user_id: Uuid) {
        self.inner
            .typing
            .write()
            .await
            .entry(event_id)
            .or_default()
            .insert(conn_id, user_id);
    }

    /// Clear the typing entry and broadcast `userStoppedTyping` if there was one.
    pub async fn stop_typing(&self, event_id: Uuid, conn_id: ConnId) -> bool {
        let user_id = {
            let mut typing = self.inner.typing.write().await;
            let Some(entries) = typing.get_mut(&event_id) else {
                return false;
            };
            let user_id = entries.remove(&conn_id);
            if entries.is_empty() {
                typing.remove(&event_id);
            }
            user_id
        };

        match user_id {
            Some(user_id) => {
                self.broadcast(
                    RoomKey::Chat(event_id),
                    &ServerEvent::UserStoppedTyping { event_id, user_id },
                    Some(conn_id),
                )
                .await;
                true
            }
            None => false,
        }
    }

    /// Drop a connection from every room and end its typing state.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let user_id = self
            .inner
            .connections
            .write()
            .await
            .remove(&conn_id)
            .map(|entry| entry.user_id);

        {
            let mut rooms = self.inner.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(&conn_id);
                !members.is_empty()
            });
        }

        let typing_events: Vec<Uuid> = self
            .inner
            .typing
            .read()
            .await
            .iter()
            .filter(|(_, entries)| entries.contains_key(&conn_id))
            .map(|(event_id, _)| *event_id)
            .collect();
        for event_id in typing_events {
            self.stop_typing(event_id, conn_id).await;
        }

        debug!("Connection {} ({:?}) removed from broker", conn_id, user_id);
    }

    // -- Introspection --

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    pub async fn room_size(&self, room: RoomKey) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(&room)
            .map_or(0, HashSet::len)
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to serialize {}: {}", event.name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(frame: &str) -> (Uuid, Uuid) {
        match serde_json::from_str::<ServerEvent>(frame).unwrap() {
            ServerEvent::UserStoppedTyping { event_id, user_id } => (event_id, user_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let d = Dispatcher::new();
        let (conn, _rx) = d.register(Uuid::new_v4()).await;
        let room = RoomKey::Chat(Uuid::new_v4());

        assert!(!d.leave(room, conn).await);
        assert!(d.join(room, conn).await);
        assert!(!d.join(room, conn).await);
        assert_eq!(d.room_size(room).await, 1);

        assert!(d.leave(room, conn).await);
        assert!(!d.leave(room, conn).await);
        assert_eq!(d.room_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_other_rooms() {
        let d = Dispatcher::new();
        let event_id = Uuid::new_v4();
        let (a, mut rx_a) = d.register(Uuid::new_v4()).await;
        let (b, mut rx_b) = d.register(Uuid::new_v4()).await;
        let (c, mut rx_c) = d.register(Uuid::new_v4()).await;
        d.join(RoomKey::Chat(event_id), a).await;
        d.join(RoomKey::Chat(event_id), b).await;
        d.join(RoomKey::Attendance(event_id), c).await;

        let event = ServerEvent::MessageUnsent {
            event_id,
            message_id: Uuid::new_v4(),
        };
        d.broadcast(RoomKey::Chat(event_id), &event, Some(a)).await;

        let frame = rx_b.try_recv().unwrap();
        assert_eq!(serde_json::from_str::<ServerEvent>(&frame).unwrap(), event);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_cleans_rooms_and_typing() {
        let d = Dispatcher::new();
        let event_id = Uuid::new_v4();
        let room = RoomKey::Chat(event_id);
        let typist = Uuid::new_v4();
        let (a, _rx_a) = d.register(typist).await;
        let (b, mut rx_b) = d.register(Uuid::new_v4()).await;
        d.join(room, a).await;
        d.join(room, b).await;
        d.join(RoomKey::Attendance(event_id), a).await;

        d.start_typing(event_id, a, typist).await;
        d.disconnect(a).await;

        assert_eq!(d.connection_count().await, 1);
        assert_eq!(d.room_count().await, 1);
        assert_eq!(stopped(&rx_b.try_recv().unwrap()), (event_id, typist));

        // a second stop has nothing to report
        assert!(!d.stop_typing(event_id, a).await);
    }

    #[tokio::test]
    async fn leaving_chat_stops_typing() {
        let d = Dispatcher::new();
        let event_id = Uuid::new_v4();
        let room = RoomKey::Chat(event_id);
        let typist = Uuid::new_v4();
        let (a, _rx_a) = d.register(typist).await;
        let (b, mut rx_b) = d.register(Uuid::new_v4()).await;
        d.join(room, a).await;
        d.join(room, b).await;

        d.start_typing(event_id, a, typist).await;
        d.leave(room, a).await;
        assert_eq!(stopped(&rx_b.try_recv().unwrap()), (event_id, typist));
    }

    #[tokio::test]
    async fn unknown_connection_cannot_join() {
        let d = Dispatcher::new();
        assert!(!d.join(RoomKey::Chat(Uuid::new_v4()), Uuid::new_v4()).await);
        assert_eq!(d.room_count().await, 0);
    }
}
