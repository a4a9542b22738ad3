/// WebSocket handler for the realtime channel.
/// Applies the identity gate before the upgrade and bridges each
/// connection to the shared `ChatServer`.
use crate::auth::{TokenVerifier, OPAQUE_AUTH_ERROR};
use crate::db::DbPool;
use crate::realtime::events::{self, ClientEvent};
use crate::realtime::{ChatServer, SessionCtx};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

/// Events a session may queue before backpressure kicks in. A full inbox
/// drops the event; the reconnect sweep reconstructs missed transitions.
const SESSION_INBOX_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket actor for individual client connections
pub struct WsActor {
    pub session: SessionCtx,
    pub server: web::Data<ChatServer>,
    inbox: Option<mpsc::Sender<ClientEvent>>,
}

impl Actor for WsActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!(
            "WebSocket connection started: {} ({})",
            self.session.session_id,
            self.session.username
        );

        // Outbound: ChatServer emissions flow through this channel into the
        // socket.
        let (tx_out, mut rx_out) = mpsc::unbounded_channel::<String>();
        let addr = ctx.address();
        tokio::spawn(async move {
            while let Some(msg) = rx_out.recv().await {
                addr.do_send(OutboundMessage(msg));
            }
        });

        // Inbound: a bounded inbox drained by one worker task keeps this
        // session's events in arrival order.
        let (tx_in, mut rx_in) = mpsc::channel::<ClientEvent>(SESSION_INBOX_CAPACITY);
        self.inbox = Some(tx_in);

        let server = self.server.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            server
                .connect(
                    &session.session_id,
                    &session.user_id,
                    &session.username,
                    tx_out,
                )
                .await;
            while let Some(event) = rx_in.recv().await {
                server.dispatch(&session, event).await;
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("WebSocket connection stopped: {}", self.session.session_id);
        // Dropping the inbox sender ends the worker after it drains.
        self.inbox = None;

        let server = self.server.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            server.disconnect(&session.session_id, &session.user_id).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match events::parse_client_event(&text) {
                Ok(event) => {
                    let Some(inbox) = self.inbox.as_ref() else {
                        return;
                    };
                    match inbox.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::warn!(
                                "[INBOX] Session '{}' inbox full; dropping event",
                                self.session.session_id
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
                Err(e) => {
                    log::error!("Failed to parse WebSocket message: {}", e);
                    ctx.text(events::message_error("Invalid message format"));
                }
            },
            Ok(ws::Message::Ping(payload)) => {
                ctx.pong(&payload);
            }
            Ok(ws::Message::Close(_)) => {
                ctx.stop();
            }
            Err(e) => {
                log::error!("WebSocket error: {}", e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct OutboundMessage(String);

impl Handler<OutboundMessage> for WsActor {
    type Result = ();

    fn handle(&mut self, msg: OutboundMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// WebSocket connection handler. The token rides the `token` query
/// parameter or an Authorization header; a rejected handshake is never
/// upgraded.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    pool: web::Data<DbPool>,
    verifier: web::Data<TokenVerifier>,
    server: web::Data<ChatServer>,
) -> actix_web::Result<HttpResponse> {
    let token = query.into_inner().token.or_else(|| bearer_token(&req));

    let principal = match verifier.verify(&pool, token.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            // Precise category stays in the logs; the client sees one
            // opaque message for every failure kind.
            log::warn!("[AUTH] Handshake rejected: {}", e);
            return Ok(HttpResponse::Unauthorized().json(json!({
                "error": OPAQUE_AUTH_ERROR
            })));
        }
    };

    let session = SessionCtx {
        session_id: format!("{}_{}", principal.username, uuid::Uuid::new_v4()),
        user_id: principal.user_id,
        username: principal.username,
    };

    let actor = WsActor {
        session,
        server: server.clone(),
        inbox: None,
    };

    let resp = ws::start(actor, &req, stream)?;
    Ok(resp)
}
