/// Pending delivered-transition timers, keyed by message id.
/// Cancellation is removal from the map; the timer task claims its entry
/// under the same mutex before acting, so cancel-vs-fire cannot race.
use std::collections::HashMap;
use tokio::sync::Mutex;

/// What the deferred transition needs to finish its job.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
}

pub struct DeliveryTimers {
    pending: Mutex<HashMap<String, PendingDelivery>>,
}

impl Default for DeliveryTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTimers {
    pub fn new() -> Self {
        DeliveryTimers {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending transition. The caller spawns the sleep task.
    pub async fn schedule(&self, message_id: &str, delivery: PendingDelivery) {
        let mut pending = self.pending.lock().await;
        pending.insert(message_id.to_string(), delivery);
    }

    /// Take ownership of the entry at fire time. None means the transition
    /// was cancelled (or already claimed) and the timer must do nothing.
    pub async fn claim(&self, message_id: &str) -> Option<PendingDelivery> {
        let mut pending = self.pending.lock().await;
        pending.remove(message_id)
    }

    /// Cancel a pending transition. Returns true when one was pending.
    pub async fn cancel(&self, message_id: &str) -> bool {
        let mut pending = self.pending.lock().await;
        pending.remove(message_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> PendingDelivery {
        PendingDelivery {
            conversation_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            recipient_id: "u2".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_takes_entry_once() {
        let timers = DeliveryTimers::new();
        timers.schedule("m1", delivery()).await;

        let claimed = timers.claim("m1").await;
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().recipient_id, "u2");

        assert!(timers.claim("m1").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_beats_claim() {
        let timers = DeliveryTimers::new();
        timers.schedule("m1", delivery()).await;

        assert!(timers.cancel("m1").await);
        assert!(timers.claim("m1").await.is_none(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let timers = DeliveryTimers::new();
        assert!(!timers.cancel("ghost").await);
    }
}
