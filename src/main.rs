/// Duo Chat Server - real-time one-to-one messaging
///
/// Main server entry point. Handles:
/// - Command-line argument parsing
/// - Database initialization
/// - Realtime state and background tasks
/// - HTTP and WebSocket server setup

use actix_web::web;
use duo_chat_server::auth::TokenVerifier;
use duo_chat_server::config::Config;
use duo_chat_server::realtime::ChatServer;
use duo_chat_server::{db, server};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let config = Config::from_args();

    log::info!("Starting Duo Chat Server");
    log::info!("Database: {:?}", config.database);
    log::info!("Port: {}", config.port);

    // Initialize database
    let pool = db::create_pool(config.database.to_str().unwrap_or("duochat.db"))
        .expect("Failed to create database pool");

    log::info!("Database initialized");

    let pool_data = web::Data::new(pool.clone());
    let verifier = web::Data::new(TokenVerifier::new(&config.auth_secret));

    let chat = ChatServer::new(pool);
    let _typing_reaper = chat.start_typing_reaper();
    let chat_data = web::Data::new(chat);

    // Start HTTP server
    let bind_addr = format!("127.0.0.1:{}", config.port);
    log::info!("Starting HTTP server on {}", bind_addr);

    let server = server::create_http_server(pool_data, chat_data, verifier, &bind_addr)?;
    server.await
}
