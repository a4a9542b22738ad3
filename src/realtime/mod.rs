/// Realtime engine: session registry, presence, rooms, typing, and the
/// message lifecycle, glued together by the `ChatServer` state shared by
/// every connection.

pub mod delivery;
pub mod events;
pub mod lifecycle;
pub mod presence;
pub mod rooms;
pub mod typing;

use crate::db::{Database, DbPool};
use delivery::DeliveryTimers;
use events::ClientEvent;
use presence::PresenceRegistry;
use rooms::RoomRouter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use typing::TypingTracker;

/// Tunable timings; tests shrink these to keep the suite fast.
#[derive(Debug, Clone, Copy)]
pub struct RealtimeConfig {
    /// Defer between accepting a send and the delivered transition.
    pub delivered_delay: Duration,
    /// Idle interval after which a typing entry expires.
    pub typing_idle: Duration,
    /// Tick of the typing expiry sweep.
    pub typing_sweep_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            delivered_delay: Duration::from_millis(1000),
            typing_idle: Duration::from_secs(3),
            typing_sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Identity of one authenticated connection, carried with every event.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
}

/// Chat server state - manages sessions, presence, rooms, and routing.
/// Cloning is cheap; all state is shared.
#[derive(Clone)]
pub struct ChatServer {
    pub sessions: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRouter>,
    pub typing: Arc<TypingTracker>,
    pub delivery: Arc<DeliveryTimers>,
    pub pool: DbPool,
    pub config: RealtimeConfig,
}

impl ChatServer {
    pub fn new(pool: DbPool) -> Self {
        Self::with_config(pool, RealtimeConfig::default())
    }

    pub fn with_config(pool: DbPool, config: RealtimeConfig) -> Self {
        ChatServer {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            presence: Arc::new(PresenceRegistry::new()),
            rooms: Arc::new(RoomRouter::new()),
            typing: Arc::new(TypingTracker::new()),
            delivery: Arc::new(DeliveryTimers::new()),
            pool,
            config,
        }
    }

    /// Register a freshly authenticated connection: wire up its outbound
    /// channel, flip presence, mirror the flag to the store, broadcast the
    /// online transition, and run the delivered sweep for messages that
    /// arrived while the user was away.
    pub async fn connect(
        &self,
        session_id: &str,
        user_id: &str,
        username: &str,
        tx: mpsc::UnboundedSender<String>,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.to_string(), tx);
            log::info!(
                "[CONNECT] Session '{}' registered for user '{}'. Total sessions: {}",
                session_id,
                username,
                sessions.len()
            );
        }

        let outcome = self.presence.attach(user_id, session_id).await;
        if let Some(replaced) = outcome.replaced {
            // The displaced connection receives nothing further.
            self.sessions.write().await.remove(&replaced);
            self.rooms.purge_session(&replaced).await;
        }

        if outcome.came_online {
            if let Err(e) = Database::set_user_online(&self.pool, user_id, true).await {
                log::error!("Failed to persist online flag for '{}': {}", user_id, e);
            }
            self.broadcast(&events::user_status(user_id, true), Some(session_id))
                .await;
        }

        self.sweep_pending_inbound(user_id).await;
    }

    /// Tear down a closed connection: report the user as stopped typing,
    /// drop room memberships and the outbound channel, and broadcast the
    /// offline transition when this was their last session.
    pub async fn disconnect(&self, session_id: &str, user_id: &str) {
        self.sessions.write().await.remove(session_id);
        self.rooms.purge_session(session_id).await;

        // A client that vanishes mid-typing must still be reported stopped.
        for stopped in self.typing.remove_user(user_id).await {
            self.emit_to_room(
                &stopped.conversation_id,
                &events::user_typing(
                    &stopped.user_id,
                    &stopped.username,
                    false,
                    &stopped.conversation_id,
                ),
                Some(session_id),
            )
            .await;
        }

        let went_offline = self.presence.detach(user_id, session_id).await;
        if went_offline {
            if let Err(e) = Database::set_user_online(&self.pool, user_id, false).await {
                log::error!("Failed to persist offline flag for '{}': {}", user_id, e);
            }
            self.broadcast(&events::user_status(user_id, false), Some(session_id))
                .await;
        }
    }

    /// Subscribe the session to a conversation room after checking the
    /// user actually belongs to it; non-participants are silently ignored.
    pub async fn join_conversation(&self, session: &SessionCtx, conversation_id: &str) {
        match Database::get_conversation(&self.pool, conversation_id).await {
            Ok(Some(conv)) if conv.is_participant(&session.user_id) => {
                self.rooms.join(&session.session_id, conversation_id).await;
            }
            Ok(_) => {
                log::warn!(
                    "[ROOM] User '{}' denied join to '{}': not a participant",
                    session.username,
                    conversation_id
                );
            }
            Err(e) => {
                log::error!("Failed to load conversation '{}': {}", conversation_id, e);
            }
        }
    }

    pub async fn leave_conversation(&self, session: &SessionCtx, conversation_id: &str) {
        self.rooms.leave(&session.session_id, conversation_id).await;
    }

    /// Typing heartbeat fan-out, originator excluded.
    pub async fn handle_typing(&self, session: &SessionCtx, conversation_id: &str, is_typing: bool) {
        if is_typing {
            self.typing
                .heartbeat(conversation_id, &session.user_id, &session.username)
                .await;
            self.emit_to_room(
                conversation_id,
                &events::user_typing(&session.user_id, &session.username, true, conversation_id),
                Some(&session.session_id),
            )
            .await;
        } else if self.typing.stop(conversation_id, &session.user_id).await {
            self.emit_to_room(
                conversation_id,
                &events::user_typing(&session.user_id, &session.username, false, conversation_id),
                Some(&session.session_id),
            )
            .await;
        }
    }

    /// Route one parsed client event. Called sequentially per session so a
    /// client's own actions keep their causal order.
    pub async fn dispatch(&self, session: &SessionCtx, event: ClientEvent) {
        match event {
            ClientEvent::JoinConversation(conversation_id) => {
                self.join_conversation(session, &conversation_id).await;
            }
            ClientEvent::LeaveConversation(conversation_id) => {
                self.leave_conversation(session, &conversation_id).await;
            }
            ClientEvent::MessageSend(payload) => {
                self.send_message(session, payload).await;
            }
            ClientEvent::MessageTyping(payload) => {
                self.handle_typing(session, &payload.conversation_id, payload.is_typing)
                    .await;
            }
            ClientEvent::MessageRead(payload) => {
                self.mark_read(session, &payload.conversation_id, &payload.message_id)
                    .await;
            }
            ClientEvent::MarkAllRead(payload) => {
                self.mark_all_read(session, &payload.conversation_id).await;
            }
            ClientEvent::TypingStart(payload) => {
                self.handle_typing(session, &payload.conversation_id, true).await;
            }
            ClientEvent::TypingStop(payload) => {
                self.handle_typing(session, &payload.conversation_id, false).await;
            }
        }
    }

    /// Background task that expires idle typing entries and reports each
    /// exactly once.
    pub fn start_typing_reaper(&self) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(server.config.typing_sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let expired = server
                    .typing
                    .expire_older_than(server.config.typing_idle)
                    .await;
                for stopped in expired {
                    log::debug!(
                        "[TYPING] Expired typing entry for '{}' in '{}'",
                        stopped.username,
                        stopped.conversation_id
                    );
                    server
                        .emit_to_room(
                            &stopped.conversation_id,
                            &events::user_typing(
                                &stopped.user_id,
                                &stopped.username,
                                false,
                                &stopped.conversation_id,
                            ),
                            None,
                        )
                        .await;
                }
            }
        })
    }

    /// Deliver a payload to one session. Send failures are dropped; a slow
    /// or vanished consumer never blocks other deliveries.
    pub async fn emit_to_session(&self, session_id: &str, payload: &str) {
        let sessions = self.sessions.read().await;
        if let Some(tx) = sessions.get(session_id) {
            let _ = tx.send(payload.to_string());
        }
    }

    /// Deliver to every session in a room, optionally excluding one.
    pub async fn emit_to_room(&self, conversation_id: &str, payload: &str, except: Option<&str>) {
        let members = self.rooms.members(conversation_id).await;
        if members.is_empty() {
            return;
        }
        let sessions = self.sessions.read().await;
        for member in &members {
            if Some(member.as_str()) == except {
                continue;
            }
            if let Some(tx) = sessions.get(member) {
                let _ = tx.send(payload.to_string());
            } else {
                log::warn!(
                    "[BROADCAST] Session '{}' is in room '{}' but has no channel",
                    member,
                    conversation_id
                );
            }
        }
    }

    /// Deliver to a user's active session; no-op while they are offline.
    pub async fn emit_to_user(&self, user_id: &str, payload: &str) {
        if let Some(session_id) = self.presence.session_of(user_id).await {
            self.emit_to_session(&session_id, payload).await;
        }
    }

    /// Deliver to every connected session, optionally excluding one.
    pub async fn broadcast(&self, payload: &str, except: Option<&str>) {
        let sessions = self.sessions.read().await;
        for (session_id, tx) in sessions.iter() {
            if Some(session_id.as_str()) == except {
                continue;
            }
            let _ = tx.send(payload.to_string());
        }
    }
}
