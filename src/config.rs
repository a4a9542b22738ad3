/// Configuration management for the chat server.
/// Handles command-line argument parsing and config structure.
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "Duo Chat Server")]
#[command(about = "Real-time one-to-one chat server", long_about = None)]
pub struct Config {
    /// Server port (default: 4000)
    #[arg(long, default_value = "4000")]
    pub port: u16,

    /// SQLite database file path (default: duochat.db)
    #[arg(long, default_value = "duochat.db")]
    pub database: PathBuf,

    /// HMAC secret the token issuer signs bearer tokens with
    #[arg(long, default_value = "dev-secret-change-me")]
    pub auth_secret: String,
}

impl Config {
    /// Parse command-line arguments into Config
    pub fn from_args() -> Self {
        Config::parse()
    }
}
