/// Presence registry: process-wide mapping from user id to their active
/// session. Source of truth for "is user X currently reachable"; the
/// persisted `is_online` flag is an eventually-consistent mirror written by
/// the caller after the registry lock is released.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Result of an attach: whether the user crossed the offline -> online
/// boundary, and the session handle that was displaced, if any.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub came_online: bool,
    pub replaced: Option<String>,
}

/// One active session per user; a newer connection replaces the older.
pub struct PresenceRegistry {
    inner: RwLock<HashMap<String, PresenceEntry>>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        PresenceRegistry {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session for a user. Idempotent for a repeated attach with
    /// the same handle; a different handle replaces the previous session.
    pub async fn attach(&self, user_id: &str, session_id: &str) -> AttachOutcome {
        let mut sessions = self.inner.write().await;

        match sessions.get(user_id) {
            Some(existing) if existing.session_id == session_id => AttachOutcome {
                came_online: false,
                replaced: None,
            },
            Some(existing) => {
                let replaced = existing.session_id.clone();
                sessions.insert(
                    user_id.to_string(),
                    PresenceEntry {
                        session_id: session_id.to_string(),
                        connected_at: Utc::now(),
                    },
                );
                log::info!(
                    "[PRESENCE] User '{}' reattached; session '{}' replaces '{}'",
                    user_id,
                    session_id,
                    replaced
                );
                AttachOutcome {
                    came_online: false,
                    replaced: Some(replaced),
                }
            }
            None => {
                sessions.insert(
                    user_id.to_string(),
                    PresenceEntry {
                        session_id: session_id.to_string(),
                        connected_at: Utc::now(),
                    },
                );
                log::info!(
                    "[PRESENCE] User '{}' online via session '{}'. Online users: {}",
                    user_id,
                    session_id,
                    sessions.len()
                );
                AttachOutcome {
                    came_online: true,
                    replaced: None,
                }
            }
        }
    }

    /// Remove a session. Returns true when this was the user's last session
    /// (the online -> offline transition). A stale handle left over from a
    /// replaced connection is ignored.
    pub async fn detach(&self, user_id: &str, session_id: &str) -> bool {
        let mut sessions = self.inner.write().await;

        match sessions.get(user_id) {
            Some(existing) if existing.session_id == session_id => {
                sessions.remove(user_id);
                log::info!(
                    "[PRESENCE] User '{}' offline. Online users: {}",
                    user_id,
                    sessions.len()
                );
                true
            }
            Some(_) => {
                log::debug!(
                    "[PRESENCE] Stale detach for user '{}' session '{}'",
                    user_id,
                    session_id
                );
                false
            }
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.read().await.contains_key(user_id)
    }

    /// The user's active session handle, if connected.
    pub async fn session_of(&self, user_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(user_id)
            .map(|entry| entry.session_id.clone())
    }
}
