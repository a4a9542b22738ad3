/// HTTP handlers module
/// Provides REST and WebSocket endpoints
pub mod rest;
pub mod websocket;

pub use rest::{create_conversation, get_messages, health, list_conversations};
pub use websocket::ws_connect;
