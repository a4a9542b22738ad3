/// Database schema initialization.
/// Sets up SQLite WAL mode and creates tables on startup.
use rusqlite::{Connection, Result as SqliteResult};

/// Initialize database connection with WAL mode and schema
pub fn initialize_database(conn: &Connection) -> SqliteResult<()> {
    // Enable WAL mode (for file-based DB only, ignore error for in-memory)
    let _ = conn.execute("PRAGMA journal_mode = WAL", []);
    let _ = conn.execute("PRAGMA synchronous = NORMAL", []);

    // Create tables
    create_schema(conn)?;

    Ok(())
}

/// Create all database tables
fn create_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            email_hash TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            is_online INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            participant_a TEXT NOT NULL,
            participant_b TEXT NOT NULL,
            last_message_id TEXT,
            last_message_content TEXT,
            last_message_time TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(participant_a, participant_b),
            CHECK(participant_a <> participant_b),
            FOREIGN KEY(participant_a) REFERENCES users(id),
            FOREIGN KEY(participant_b) REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS conversation_unread (
            conversation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, user_id),
            CHECK(count >= 0),
            FOREIGN KEY(conversation_id) REFERENCES conversations(id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            status TEXT NOT NULL DEFAULT 'sent',
            is_read INTEGER NOT NULL DEFAULT 0,
            delivered_at TEXT,
            read_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(conversation_id) REFERENCES conversations(id),
            FOREIGN KEY(sender_id) REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            read_at TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id),
            FOREIGN KEY(message_id) REFERENCES messages(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_participant_a ON conversations(participant_a);
        CREATE INDEX IF NOT EXISTS idx_conversations_participant_b ON conversations(participant_b);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(conversation_id, status);
        CREATE INDEX IF NOT EXISTS idx_message_reads_user ON message_reads(user_id);
        "#,
    )?;

    Ok(())
}
