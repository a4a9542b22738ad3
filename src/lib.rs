/// Real-time one-to-one chat server core.
///
/// Exposes the library surface consumed by the binary and the integration
/// tests: configuration, the identity gate, the store adapter, the
/// realtime engine, and the HTTP/WebSocket handlers.

pub mod auth;
pub mod config;
pub mod db;
pub mod handlers;
pub mod realtime;
pub mod server;
