/// Typing tracker: per-conversation map of who is typing, fed by client
/// heartbeats and drained by a background expiry sweep.
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct TypingEntry {
    username: String,
    last_seen: Instant,
}

/// An entry that stopped typing, ready for the `isTyping:false` emission.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedTyping {
    pub conversation_id: String,
    pub user_id: String,
    pub username: String,
}

pub struct TypingTracker {
    inner: RwLock<HashMap<(String, String), TypingEntry>>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TypingTracker {
    pub fn new() -> Self {
        TypingTracker {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record a typing heartbeat, refreshing the expiry clock.
    pub async fn heartbeat(&self, conversation_id: &str, user_id: &str, username: &str) {
        let mut entries = self.inner.write().await;
        entries.insert(
            (conversation_id.to_string(), user_id.to_string()),
            TypingEntry {
                username: username.to_string(),
                last_seen: Instant::now(),
            },
        );
    }

    /// Explicit stop. Returns true when a live entry was removed; the
    /// caller only emits `isTyping:false` in that case, so the expiry sweep
    /// keeps its exactly-once guarantee.
    pub async fn stop(&self, conversation_id: &str, user_id: &str) -> bool {
        let mut entries = self.inner.write().await;
        entries
            .remove(&(conversation_id.to_string(), user_id.to_string()))
            .is_some()
    }

    /// Drain entries idle longer than `idle`; each is reported exactly once.
    pub async fn expire_older_than(&self, idle: Duration) -> Vec<StoppedTyping> {
        let mut entries = self.inner.write().await;
        let now = Instant::now();

        let expired: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) >= idle)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| StoppedTyping {
                    conversation_id: key.0,
                    user_id: key.1,
                    username: entry.username,
                })
            })
            .collect()
    }

    /// Drop every entry of a disconnecting user so the other participant
    /// still sees them stop typing.
    pub async fn remove_user(&self, user_id: &str) -> Vec<StoppedTyping> {
        let mut entries = self.inner.write().await;

        let keys: Vec<(String, String)> = entries
            .keys()
            .filter(|(_, uid)| uid == user_id)
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| StoppedTyping {
                    conversation_id: key.0,
                    user_id: key.1,
                    username: entry.username,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_then_stop() {
        let tracker = TypingTracker::new();
        tracker.heartbeat("c1", "u1", "alice").await;

        assert!(tracker.stop("c1", "u1").await);
        // Second stop finds nothing
        assert!(!tracker.stop("c1", "u1").await);
    }

    #[tokio::test]
    async fn test_expiry_reports_exactly_once() {
        let tracker = TypingTracker::new();
        tracker.heartbeat("c1", "u1", "alice").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let expired = tracker.expire_older_than(Duration::from_millis(20)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].conversation_id, "c1");
        assert_eq!(expired[0].username, "alice");

        let again = tracker.expire_older_than(Duration::from_millis(20)).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_expiry() {
        let tracker = TypingTracker::new();
        tracker.heartbeat("c1", "u1", "alice").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.heartbeat("c1", "u1", "alice").await;

        let expired = tracker.expire_older_than(Duration::from_millis(25)).await;
        assert!(expired.is_empty(), "fresh heartbeat must not expire");
    }

    #[tokio::test]
    async fn test_remove_user_collects_all_conversations() {
        let tracker = TypingTracker::new();
        tracker.heartbeat("c1", "u1", "alice").await;
        tracker.heartbeat("c2", "u1", "alice").await;
        tracker.heartbeat("c1", "u2", "bob").await;

        let mut stopped = tracker.remove_user("u1").await;
        stopped.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped[0].conversation_id, "c1");
        assert_eq!(stopped[1].conversation_id, "c2");

        // Bob's entry is untouched
        assert!(tracker.stop("c1", "u2").await);
    }
}
