/// Room router: per-conversation membership of connected sessions.
/// Both indices live behind one lock so join/leave/purge stay atomic.
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct RoomIndex {
    by_room: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, HashSet<String>>,
}

pub struct RoomRouter {
    inner: RwLock<RoomIndex>,
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRouter {
    pub fn new() -> Self {
        RoomRouter {
            inner: RwLock::new(RoomIndex::default()),
        }
    }

    /// Subscribe a session to a conversation room. The participant check
    /// happens at the caller; the router only tracks membership.
    pub async fn join(&self, session_id: &str, conversation_id: &str) {
        let mut index = self.inner.write().await;
        index
            .by_room
            .entry(conversation_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        index
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(conversation_id.to_string());
        log::info!(
            "[ROOM] Session '{}' joined room '{}'. Room now has {} members",
            session_id,
            conversation_id,
            index.by_room.get(conversation_id).map(|m| m.len()).unwrap_or(0)
        );
    }

    pub async fn leave(&self, session_id: &str, conversation_id: &str) {
        let mut index = self.inner.write().await;
        let was_member = match index.by_room.get_mut(conversation_id) {
            Some(members) => {
                let removed = members.remove(session_id);
                if members.is_empty() {
                    index.by_room.remove(conversation_id);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = index.by_session.get_mut(session_id) {
            rooms.remove(conversation_id);
            if rooms.is_empty() {
                index.by_session.remove(session_id);
            }
        }

        if was_member {
            log::info!(
                "[ROOM] Session '{}' left room '{}'",
                session_id,
                conversation_id
            );
        } else {
            log::warn!(
                "[ROOM] Session '{}' was not in room '{}'",
                session_id,
                conversation_id
            );
        }
    }

    /// Remove a session from every room it was in; returns the rooms left.
    pub async fn purge_session(&self, session_id: &str) -> Vec<String> {
        let mut index = self.inner.write().await;
        let rooms = index
            .by_session
            .remove(session_id)
            .map(|set| set.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();

        for conversation_id in &rooms {
            if let Some(members) = index.by_room.get_mut(conversation_id) {
                members.remove(session_id);
                if members.is_empty() {
                    index.by_room.remove(conversation_id);
                }
            }
        }

        if !rooms.is_empty() {
            log::info!(
                "[ROOM] Purged session '{}' from rooms: {:?}",
                session_id,
                rooms
            );
        }
        rooms
    }

    /// Sessions currently subscribed to a conversation.
    pub async fn members(&self, conversation_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_room
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn rooms_of(&self, session_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_session
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
