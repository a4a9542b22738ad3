/// Event dispatcher: the wire vocabulary of the realtime channel.
/// Owns the outbound event names and envelope builders plus the inbound
/// client event surface; no other module constructs raw envelopes.
use crate::db::models::{Message, MessageStatus};
use serde::Deserialize;
use serde_json::{json, Value};

// Server -> client event names (case-sensitive wire contract)
pub const USER_STATUS: &str = "user:status";
pub const USER_TYPING: &str = "user:typing";
pub const MESSAGE_NEW: &str = "message:new";
pub const MESSAGE_SENT: &str = "message:sent";
pub const MESSAGE_STATUS: &str = "message:status";
pub const MESSAGE_ERROR: &str = "message:error";
pub const CONVERSATION_UNREAD_UPDATE: &str = "conversation:unreadUpdate";

/// Wrap a payload in the channel envelope.
fn envelope(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

/// Broadcast when a user crosses the offline/online boundary.
pub fn user_status(user_id: &str, is_online: bool) -> String {
    envelope(
        USER_STATUS,
        json!({ "userId": user_id, "isOnline": is_online }),
    )
}

pub fn user_typing(
    user_id: &str,
    username: &str,
    is_typing: bool,
    conversation_id: &str,
) -> String {
    envelope(
        USER_TYPING,
        json!({
            "userId": user_id,
            "username": username,
            "isTyping": is_typing,
            "conversationId": conversation_id,
        }),
    )
}

/// The full message fanned out to the room, sender expanded.
pub fn message_new(message: &Message, sender_username: &str, client_temp_id: Option<&str>) -> String {
    let mut data = json!({
        "id": message.id,
        "conversationId": message.conversation_id,
        "senderId": message.sender_id,
        "sender": { "id": message.sender_id, "username": sender_username },
        "content": message.content,
        "messageType": message.message_type.as_str(),
        "status": message.status.as_str(),
        "isRead": message.is_read,
        "readBy": message.read_by,
        "deliveredAt": message.delivered_at,
        "readAt": message.read_at,
        "createdAt": message.created_at,
    });
    if let Some(temp_id) = client_temp_id {
        data["clientTempId"] = json!(temp_id);
    }
    envelope(MESSAGE_NEW, data)
}

/// Persistence acknowledgement, sender session only.
pub fn message_sent(message_id: &str, conversation_id: &str, client_temp_id: Option<&str>) -> String {
    let mut data = json!({
        "messageId": message_id,
        "status": MessageStatus::Sent.as_str(),
        "conversationId": conversation_id,
    });
    if let Some(temp_id) = client_temp_id {
        data["clientTempId"] = json!(temp_id);
    }
    envelope(MESSAGE_SENT, data)
}

/// Lifecycle transition notification. Read transitions carry the receipt
/// set and timestamp.
pub fn message_status(
    message_id: &str,
    status: MessageStatus,
    conversation_id: &str,
    read_by: Option<&[String]>,
    read_at: Option<&str>,
) -> String {
    let mut data = json!({
        "messageId": message_id,
        "status": status.as_str(),
        "conversationId": conversation_id,
    });
    if let Some(read_by) = read_by {
        data["readBy"] = json!(read_by);
    }
    if let Some(read_at) = read_at {
        data["readAt"] = json!(read_at);
    }
    envelope(MESSAGE_STATUS, data)
}

pub fn message_error(error: &str) -> String {
    envelope(MESSAGE_ERROR, json!({ "error": error }))
}

pub fn unread_update(
    conversation_id: &str,
    unread_count: i64,
    sender: Option<(&str, &str)>,
    updated_by: Option<&str>,
    action: Option<&str>,
) -> String {
    let mut data = json!({
        "conversationId": conversation_id,
        "unreadCount": unread_count,
    });
    if let Some((sender_id, sender_username)) = sender {
        data["senderId"] = json!(sender_id);
        data["senderUsername"] = json!(sender_username);
    }
    if let Some(updated_by) = updated_by {
        data["updatedBy"] = json!(updated_by);
    }
    if let Some(action) = action {
        data["action"] = json!(action);
    }
    envelope(CONVERSATION_UNREAD_UPDATE, data)
}

// Client -> server event surface

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub client_temp_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessagePayload {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

/// Every event a connected client may emit, discriminated by the `event`
/// field of the envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join:conversation")]
    JoinConversation(String),
    #[serde(rename = "leave:conversation")]
    LeaveConversation(String),
    #[serde(rename = "message:send")]
    MessageSend(SendMessagePayload),
    #[serde(rename = "message:typing")]
    MessageTyping(TypingPayload),
    #[serde(rename = "message:read")]
    MessageRead(ReadMessagePayload),
    #[serde(rename = "conversation:markAllRead")]
    MarkAllRead(ConversationRef),
    // Aliases for message:typing kept for older clients
    #[serde(rename = "typing:start")]
    TypingStart(ConversationRef),
    #[serde(rename = "typing:stop")]
    TypingStop(ConversationRef),
}

pub fn parse_client_event(text: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MessageType;

    fn sample_message() -> Message {
        Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            content: "hi".to_string(),
            message_type: MessageType::Text,
            status: MessageStatus::Sent,
            is_read: false,
            read_by: vec![],
            delivered_at: None,
            read_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn parse(envelope: &str) -> Value {
        serde_json::from_str(envelope).expect("envelope must be valid JSON")
    }

    #[test]
    fn test_user_status_envelope() {
        let parsed = parse(&user_status("u1", true));
        assert_eq!(parsed["event"], "user:status");
        assert_eq!(parsed["data"]["userId"], "u1");
        assert_eq!(parsed["data"]["isOnline"], true);
    }

    #[test]
    fn test_message_new_expands_sender() {
        let parsed = parse(&message_new(&sample_message(), "alice", Some("t1")));
        assert_eq!(parsed["event"], "message:new");
        assert_eq!(parsed["data"]["sender"]["id"], "u1");
        assert_eq!(parsed["data"]["sender"]["username"], "alice");
        assert_eq!(parsed["data"]["status"], "sent");
        assert_eq!(parsed["data"]["clientTempId"], "t1");
    }

    #[test]
    fn test_message_new_omits_absent_temp_id() {
        let parsed = parse(&message_new(&sample_message(), "alice", None));
        assert!(parsed["data"].get("clientTempId").is_none());
    }

    #[test]
    fn test_message_status_read_carries_receipts() {
        let read_by = vec!["u2".to_string()];
        let parsed = parse(&message_status(
            "m1",
            MessageStatus::Read,
            "c1",
            Some(&read_by),
            Some("2026-01-01T00:00:01Z"),
        ));
        assert_eq!(parsed["data"]["status"], "read");
        assert_eq!(parsed["data"]["readBy"][0], "u2");
        assert_eq!(parsed["data"]["readAt"], "2026-01-01T00:00:01Z");
    }

    #[test]
    fn test_message_status_delivered_has_no_receipts() {
        let parsed = parse(&message_status(
            "m1",
            MessageStatus::Delivered,
            "c1",
            None,
            None,
        ));
        assert_eq!(parsed["data"]["status"], "delivered");
        assert!(parsed["data"].get("readBy").is_none());
        assert!(parsed["data"].get("readAt").is_none());
    }

    #[test]
    fn test_unread_update_optional_fields() {
        let bare = parse(&unread_update("c1", 3, None, None, None));
        assert_eq!(bare["data"]["unreadCount"], 3);
        assert!(bare["data"].get("senderId").is_none());

        let full = parse(&unread_update(
            "c1",
            0,
            Some(("u1", "alice")),
            Some("u2"),
            Some("markAllRead"),
        ));
        assert_eq!(full["data"]["senderUsername"], "alice");
        assert_eq!(full["data"]["updatedBy"], "u2");
        assert_eq!(full["data"]["action"], "markAllRead");
    }

    #[test]
    fn test_parse_join_event() {
        let event = parse_client_event(r#"{"event":"join:conversation","data":"c1"}"#)
            .expect("Event should parse");
        assert!(matches!(event, ClientEvent::JoinConversation(id) if id == "c1"));
    }

    #[test]
    fn test_parse_send_event() {
        let event = parse_client_event(
            r#"{"event":"message:send","data":{"conversationId":"c1","content":"hi","clientTempId":"t1"}}"#,
        )
        .expect("Event should parse");
        match event {
            ClientEvent::MessageSend(payload) => {
                assert_eq!(payload.conversation_id, "c1");
                assert_eq!(payload.content, "hi");
                assert_eq!(payload.client_temp_id.as_deref(), Some("t1"));
                assert!(payload.message_type.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_typing_aliases() {
        let start = parse_client_event(r#"{"event":"typing:start","data":{"conversationId":"c1"}}"#)
            .expect("Event should parse");
        assert!(matches!(start, ClientEvent::TypingStart(p) if p.conversation_id == "c1"));

        let stop = parse_client_event(r#"{"event":"typing:stop","data":{"conversationId":"c1"}}"#)
            .expect("Event should parse");
        assert!(matches!(stop, ClientEvent::TypingStop(p) if p.conversation_id == "c1"));
    }

    #[test]
    fn test_parse_unknown_event_fails() {
        assert!(parse_client_event(r#"{"event":"message:delete","data":{}}"#).is_err());
        assert!(parse_client_event("not json").is_err());
    }
}
