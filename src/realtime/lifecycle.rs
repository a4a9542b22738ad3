/// Message lifecycle engine: accepts sends, persists them, fans out, and
/// drives the sent -> delivered -> read transitions coordinated with
/// presence and the per-participant unread counters.
use super::delivery::PendingDelivery;
use super::{events, ChatServer, SessionCtx};
use crate::db::models::{MessageStatus, MessageType};
use crate::db::{is_transient, Database};
use chrono::Utc;
use std::time::Duration;

/// Server-enforced bound on message content, counted after trimming.
pub const MAX_CONTENT_LEN: usize = 4000;

const SEND_RETRY_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(25);

impl ChatServer {
    /// Accept a send: validate, persist transactionally, fan out, and
    /// defer the delivered transition when the recipient is reachable.
    pub async fn send_message(&self, session: &SessionCtx, payload: events::SendMessagePayload) {
        let content = payload.content.trim();
        if content.is_empty() {
            self.emit_to_session(
                &session.session_id,
                &events::message_error("Message content must not be empty"),
            )
            .await;
            return;
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            self.emit_to_session(
                &session.session_id,
                &events::message_error("Message content exceeds the 4000 character limit"),
            )
            .await;
            return;
        }
        let message_type = match payload.message_type.as_deref() {
            None => MessageType::Text,
            Some(raw) => match MessageType::from_str(raw) {
                Some(ty) => ty,
                None => {
                    self.emit_to_session(
                        &session.session_id,
                        &events::message_error("Unknown message type"),
                    )
                    .await;
                    return;
                }
            },
        };

        let conv = match Database::get_conversation(&self.pool, &payload.conversation_id).await {
            Ok(Some(conv)) => conv,
            Ok(None) => {
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Unknown conversation"),
                )
                .await;
                return;
            }
            Err(e) => {
                log::error!(
                    "Failed to load conversation '{}': {}",
                    payload.conversation_id,
                    e
                );
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Failed to send message"),
                )
                .await;
                return;
            }
        };
        let Some(recipient_id) = conv.other_participant(&session.user_id).map(str::to_string)
        else {
            log::warn!(
                "[SEND] User '{}' is not a participant of '{}'",
                session.username,
                conv.id
            );
            self.emit_to_session(
                &session.session_id,
                &events::message_error("Not a participant of this conversation"),
            )
            .await;
            return;
        };

        // One transaction: message row, conversation preview, recipient
        // unread counter. Transient store failures retry with backoff.
        let mut attempt = 0;
        let (message, recipient_unread) = loop {
            match Database::record_message(
                &self.pool,
                &conv.id,
                &session.user_id,
                &recipient_id,
                content,
                message_type,
            )
            .await
            {
                Ok(result) => break result,
                Err(e) if is_transient(&e) && attempt + 1 < SEND_RETRY_ATTEMPTS => {
                    attempt += 1;
                    log::warn!("[SEND] Transient store failure (attempt {}): {}", attempt, e);
                    tokio::time::sleep(SEND_RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    log::error!(
                        "[SEND] Failed to persist message from '{}' to '{}': {}",
                        session.username,
                        conv.id,
                        e
                    );
                    self.emit_to_session(
                        &session.session_id,
                        &events::message_error("Failed to send message"),
                    )
                    .await;
                    return;
                }
            }
        };
        log::info!(
            "[SEND] Message '{}' from '{}' persisted to conversation '{}'",
            message.id,
            session.username,
            conv.id
        );

        self.emit_to_room(
            &conv.id,
            &events::message_new(&message, &session.username, payload.client_temp_id.as_deref()),
            None,
        )
        .await;
        self.emit_to_session(
            &session.session_id,
            &events::message_sent(&message.id, &conv.id, payload.client_temp_id.as_deref()),
        )
        .await;

        if self.presence.is_online(&recipient_id).await {
            self.emit_to_user(
                &recipient_id,
                &events::unread_update(
                    &conv.id,
                    recipient_unread,
                    Some((&session.user_id, &session.username)),
                    None,
                    None,
                ),
            )
            .await;
            self.schedule_delivery(&message.id, &conv.id, &session.user_id, &recipient_id)
                .await;
        }
    }

    /// Register the pending transition, then arm the timer. The entry goes
    /// into the map before the task exists so a racing read always finds
    /// something to cancel.
    async fn schedule_delivery(
        &self,
        message_id: &str,
        conversation_id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) {
        self.delivery
            .schedule(
                message_id,
                PendingDelivery {
                    conversation_id: conversation_id.to_string(),
                    sender_id: sender_id.to_string(),
                    recipient_id: recipient_id.to_string(),
                },
            )
            .await;

        let server = self.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(server.config.delivered_delay).await;

            let Some(pending) = server.delivery.claim(&message_id).await else {
                return; // cancelled by a read
            };
            // Recipient vanished mid-defer: leave the message `sent` so the
            // reconnect sweep owns the transition.
            if !server.presence.is_online(&pending.recipient_id).await {
                return;
            }

            let now = Utc::now().to_rfc3339();
            match Database::mark_delivered(&server.pool, &message_id, &now).await {
                Ok(true) => {
                    server
                        .emit_to_user(
                            &pending.sender_id,
                            &events::message_status(
                                &message_id,
                                MessageStatus::Delivered,
                                &pending.conversation_id,
                                None,
                                None,
                            ),
                        )
                        .await;
                }
                Ok(false) => {
                    // A read transition superseded the timer.
                }
                Err(e) => {
                    log::error!("Failed delivered transition for '{}': {}", message_id, e);
                }
            }
        });
    }

    /// Read acknowledgement for one message.
    pub async fn mark_read(&self, session: &SessionCtx, conversation_id: &str, message_id: &str) {
        let conv = match Database::get_conversation(&self.pool, conversation_id).await {
            Ok(Some(conv)) => conv,
            Ok(None) => {
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Unknown conversation"),
                )
                .await;
                return;
            }
            Err(e) => {
                log::error!("Failed to load conversation '{}': {}", conversation_id, e);
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Failed to mark message read"),
                )
                .await;
                return;
            }
        };
        if !conv.is_participant(&session.user_id) {
            self.emit_to_session(
                &session.session_id,
                &events::message_error("Not a participant of this conversation"),
            )
            .await;
            return;
        }

        // Cancel before transitioning so the timer cannot interleave a
        // spurious delivered emission.
        self.delivery.cancel(message_id).await;

        let now = Utc::now().to_rfc3339();
        match Database::mark_read(&self.pool, message_id, &session.user_id, &now).await {
            Ok(Some(updated)) => {
                self.emit_to_room(
                    &conv.id,
                    &events::message_status(
                        &updated.id,
                        MessageStatus::Read,
                        &conv.id,
                        Some(&updated.read_by),
                        updated.read_at.as_deref(),
                    ),
                    None,
                )
                .await;
                self.emit_unread_updates(&conv.id, &conv.participant_a, &conv.participant_b, session, None)
                    .await;
            }
            Ok(None) => {
                // Unknown id, repeat read, or sender reading their own
                // message; all idempotent no-ops.
                log::debug!(
                    "[READ] No-op read of '{}' by '{}'",
                    message_id,
                    session.username
                );
            }
            Err(e) => {
                log::error!("Failed read transition for '{}': {}", message_id, e);
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Failed to mark message read"),
                )
                .await;
            }
        }
    }

    /// Transition every unread inbound message of the conversation for this
    /// reader. A repeat call transitions nothing and stays silent.
    pub async fn mark_all_read(&self, session: &SessionCtx, conversation_id: &str) {
        let conv = match Database::get_conversation(&self.pool, conversation_id).await {
            Ok(Some(conv)) => conv,
            Ok(None) => {
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Unknown conversation"),
                )
                .await;
                return;
            }
            Err(e) => {
                log::error!("Failed to load conversation '{}': {}", conversation_id, e);
                self.emit_to_session(
                    &session.session_id,
                    &events::message_error("Failed to mark conversation read"),
                )
                .await;
                return;
            }
        };
        if !conv.is_participant(&session.user_id) {
            self.emit_to_session(
                &session.session_id,
                &events::message_error("Not a participant of this conversation"),
            )
            .await;
            return;
        }

        let now = Utc::now().to_rfc3339();
        let updated =
            match Database::mark_all_read(&self.pool, &conv.id, &session.user_id, &now).await {
                Ok(updated) => updated,
                Err(e) => {
                    log::error!("Failed bulk read in '{}': {}", conv.id, e);
                    self.emit_to_session(
                        &session.session_id,
                        &events::message_error("Failed to mark conversation read"),
                    )
                    .await;
                    return;
                }
            };
        if updated.is_empty() {
            return;
        }
        log::info!(
            "[READ] '{}' marked {} messages read in '{}'",
            session.username,
            updated.len(),
            conv.id
        );

        for message in &updated {
            self.delivery.cancel(&message.id).await;
        }
        for message in &updated {
            self.emit_to_room(
                &conv.id,
                &events::message_status(
                    &message.id,
                    MessageStatus::Read,
                    &conv.id,
                    Some(&message.read_by),
                    message.read_at.as_deref(),
                ),
                None,
            )
            .await;
        }
        self.emit_unread_updates(
            &conv.id,
            &conv.participant_a,
            &conv.participant_b,
            session,
            Some("markAllRead"),
        )
        .await;
    }

    async fn emit_unread_updates(
        &self,
        conversation_id: &str,
        participant_a: &str,
        participant_b: &str,
        updated_by: &SessionCtx,
        action: Option<&str>,
    ) {
        for participant in [participant_a, participant_b] {
            let count = match Database::unread_count(&self.pool, conversation_id, participant).await
            {
                Ok(count) => count,
                Err(e) => {
                    log::error!(
                        "Failed unread lookup for '{}' in '{}': {}",
                        participant,
                        conversation_id,
                        e
                    );
                    continue;
                }
            };
            self.emit_to_user(
                participant,
                &events::unread_update(
                    conversation_id,
                    count,
                    None,
                    Some(&updated_by.user_id),
                    action,
                ),
            )
            .await;
        }
    }

    /// Reconnect sweep: everything still `sent` and addressed to this user
    /// becomes `delivered` in bulk, with one status event per message to
    /// each original sender still online.
    pub async fn sweep_pending_inbound(&self, user_id: &str) {
        let pending = match Database::pending_inbound_for(&self.pool, user_id).await {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Failed pending-inbound scan for '{}': {}", user_id, e);
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let now = Utc::now().to_rfc3339();
        let ids: Vec<String> = pending.iter().map(|p| p.message_id.clone()).collect();
        match Database::mark_delivered_bulk(&self.pool, &ids, &now).await {
            Ok(changed) => {
                log::info!(
                    "[SWEEP] Marked {} pending messages delivered for '{}'",
                    changed,
                    user_id
                );
            }
            Err(e) => {
                log::error!("Failed delivered sweep for '{}': {}", user_id, e);
                return;
            }
        }

        for item in &pending {
            if self.presence.is_online(&item.sender_id).await {
                self.emit_to_user(
                    &item.sender_id,
                    &events::message_status(
                        &item.message_id,
                        MessageStatus::Delivered,
                        &item.conversation_id,
                        None,
                        None,
                    ),
                )
                .await;
            }
        }
    }
}
