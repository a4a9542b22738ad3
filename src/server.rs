use crate::auth::TokenVerifier;
use crate::db::DbPool;
use crate::handlers::{create_conversation, get_messages, health, list_conversations, ws_connect};
use crate::realtime::ChatServer;
/// HTTP server factory and configuration.
/// Provides a reusable function to create and configure the HTTP server
/// for use in both the main binary and tests.
use actix_web::{middleware, web, App, HttpServer};

/// Create a configured HTTP server
///
/// Takes a database pool, chat server state, token verifier, and bind
/// address, then returns a fully configured `HttpServer` ready to be run.
pub fn create_http_server(
    pool: web::Data<DbPool>,
    chat: web::Data<ChatServer>,
    verifier: web::Data<TokenVerifier>,
    bind_addr: &str,
) -> std::io::Result<actix_web::dev::Server> {
    let pool_clone = pool.clone();
    let chat_clone = chat.clone();
    let verifier_clone = verifier.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(pool_clone.clone())
            .app_data(chat_clone.clone())
            .app_data(verifier_clone.clone())
            .wrap(middleware::Logger::default())
            // REST endpoints
            .route("/health", web::get().to(health))
            .route("/conversations", web::post().to(create_conversation))
            .route("/conversations", web::get().to(list_conversations))
            .route(
                "/conversations/{conversation_id}/messages",
                web::get().to(get_messages),
            )
            // WebSocket endpoint
            .route("/ws", web::get().to(ws_connect))
    })
    .bind(bind_addr)?
    .run();

    Ok(server)
}

/// Create a test HTTP server with custom database pool
///
/// Allows tests to provide their own database pool, enabling testing of
/// data persistence across multiple server instantiations. The server binds
/// to a random available port.
///
/// # Returns
/// A tuple of (server, bind_address) where bind_address can be used to make requests
pub fn create_test_http_server_with_pool(
    pool: web::Data<DbPool>,
    secret: &str,
) -> std::io::Result<(actix_web::dev::Server, String)> {
    let chat = web::Data::new(ChatServer::new(pool.get_ref().clone()));
    let verifier = web::Data::new(TokenVerifier::new(secret));

    // Bind to 127.0.0.1:0 to get a random available port
    let bind_addr = "127.0.0.1:0";
    let pool_clone = pool.clone();
    let chat_clone = chat.clone();
    let verifier_clone = verifier.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(pool_clone.clone())
            .app_data(chat_clone.clone())
            .app_data(verifier_clone.clone())
            .wrap(middleware::Logger::default())
            // REST endpoints
            .route("/health", web::get().to(health))
            .route("/conversations", web::post().to(create_conversation))
            .route("/conversations", web::get().to(list_conversations))
            .route(
                "/conversations/{conversation_id}/messages",
                web::get().to(get_messages),
            )
            // WebSocket endpoint
            .route("/ws", web::get().to(ws_connect))
    })
    .bind(bind_addr)?;

    // Get the actual bind address (including the assigned port)
    let addrs = server.addrs();
    let addr_str = addrs
        .first()
        .ok_or_else(|| std::io::Error::other("No bind address found"))?
        .to_string();

    let server = server.run();

    Ok((server, addr_str))
}

/// Create a test HTTP server with in-memory database
///
/// Convenience function for tests that need a fully configured server
/// without setting up the pool, chat state, or verifier by hand.
/// Binds to a random available port.
pub fn create_test_http_server() -> std::io::Result<(actix_web::dev::Server, String)> {
    let pool = web::Data::new(crate::db::create_test_pool());
    create_test_http_server_with_pool(pool, "test-secret")
}
