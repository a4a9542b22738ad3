/// REST API handlers for HTTP endpoints.
/// Conversation bootstrap and message history; both share the realtime
/// store adapter so the WebSocket core and the REST surface never diverge.

use crate::auth::{Principal, TokenVerifier, OPAQUE_AUTH_ERROR};
use crate::db::{models::*, Database, DbPool};
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_MESSAGE_PAGE: i64 = 50;
const MAX_MESSAGE_PAGE: i64 = 200;

/// Resolve the bearer principal or produce the opaque 401 response.
async fn authenticate(
    req: &HttpRequest,
    pool: &DbPool,
    verifier: &TokenVerifier,
) -> Result<Principal, HttpResponse> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    verifier.verify(pool, token).await.map_err(|e| {
        log::warn!("[AUTH] Request rejected: {}", e);
        HttpResponse::Unauthorized().json(json!({ "error": OPAQUE_AUTH_ERROR }))
    })
}

/// Bootstrap (or fetch) the conversation with another user
/// POST /conversations
pub async fn create_conversation(
    req: HttpRequest,
    pool: web::Data<DbPool>,
    verifier: web::Data<TokenVerifier>,
    body: web::Json<CreateConversationRequest>,
) -> ActixResult<HttpResponse> {
    let principal = match authenticate(&req, &pool, &verifier).await {
        Ok(principal) => principal,
        Err(resp) => return Ok(resp),
    };

    if body.participant_id == principal.user_id {
        return Ok(HttpResponse::BadRequest().json(json!({
            "error": "Cannot start a conversation with yourself"
        })));
    }

    match Database::get_user_by_id(&pool, &body.participant_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Ok(HttpResponse::NotFound().json(json!({
                "error": "User not found"
            })))
        }
        Err(e) => {
            log::error!("Database error: {}", e);
            return Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to check participant"
            })));
        }
    }

    // Conversations are created lazily, once per pair
    match Database::get_conversation_by_pair(&pool, &principal.user_id, &body.participant_id).await
    {
        Ok(Some(existing)) => return Ok(HttpResponse::Ok().json(existing)),
        Ok(None) => {}
        Err(e) => {
            log::error!("Database error: {}", e);
            return Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to look up conversation"
            })));
        }
    }

    match Database::create_conversation(&pool, &principal.user_id, &body.participant_id).await {
        Ok(conv) => Ok(HttpResponse::Created().json(conv)),
        Err(e) => {
            log::error!("Failed to create conversation: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to create conversation"
            })))
        }
    }
}

/// List the caller's conversations, most recently active first
/// GET /conversations
pub async fn list_conversations(
    req: HttpRequest,
    pool: web::Data<DbPool>,
    verifier: web::Data<TokenVerifier>,
) -> ActixResult<HttpResponse> {
    let principal = match authenticate(&req, &pool, &verifier).await {
        Ok(principal) => principal,
        Err(resp) => return Ok(resp),
    };

    match Database::list_conversations_for(&pool, &principal.user_id).await {
        Ok(conversations) => {
            // Enrich with the other participant's profile
            let mut enriched = Vec::with_capacity(conversations.len());
            for conv in &conversations {
                let other_id = conv
                    .other_participant(&principal.user_id)
                    .unwrap_or_default()
                    .to_string();
                let other = Database::get_user_by_id(&pool, &other_id).await.ok().flatten();
                enriched.push(json!({
                    "id": conv.id,
                    "participant": other.map(|u| json!({
                        "id": u.id,
                        "username": u.username,
                        "isOnline": u.is_online,
                    })),
                    "lastMessageId": conv.last_message_id,
                    "lastMessageContent": conv.last_message_content,
                    "lastMessageTime": conv.last_message_time,
                    "unreadCount": conv.unread_count.get(&principal.user_id).copied().unwrap_or(0),
                    "updatedAt": conv.updated_at,
                }));
            }
            Ok(HttpResponse::Ok().json(enriched))
        }
        Err(e) => {
            log::error!("Database error: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to list conversations"
            })))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
}

/// Message history for a conversation, newest first
/// GET /conversations/{id}/messages
pub async fn get_messages(
    req: HttpRequest,
    pool: web::Data<DbPool>,
    verifier: web::Data<TokenVerifier>,
    conversation_id: web::Path<String>,
    query: web::Query<MessagesQuery>,
) -> ActixResult<HttpResponse> {
    let principal = match authenticate(&req, &pool, &verifier).await {
        Ok(principal) => principal,
        Err(resp) => return Ok(resp),
    };

    let conv = match Database::get_conversation(&pool, &conversation_id).await {
        Ok(Some(conv)) => conv,
        Ok(None) => {
            return Ok(HttpResponse::NotFound().json(json!({
                "error": "Conversation not found"
            })))
        }
        Err(e) => {
            log::error!("Database error: {}", e);
            return Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to load conversation"
            })));
        }
    };
    if !conv.is_participant(&principal.user_id) {
        return Ok(HttpResponse::Forbidden().json(json!({
            "error": "Not a participant of this conversation"
        })));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_PAGE)
        .clamp(1, MAX_MESSAGE_PAGE);
    match Database::list_messages(&pool, &conv.id, limit).await {
        Ok(messages) => Ok(HttpResponse::Ok().json(messages)),
        Err(e) => {
            log::error!("Database error: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to load messages"
            })))
        }
    }
}

/// Health check endpoint
/// GET /health
pub async fn health() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok"
    })))
}
