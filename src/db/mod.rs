/// Database layer for persistent storage.
/// Handles all database operations for users, conversations, messages,
/// unread counters, and read receipts.

pub mod init;
pub mod models;

use chrono::Utc;
use models::{Conversation, Message, MessageStatus, MessageType, User};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type DbPool = Arc<Mutex<Connection>>;

/// Create a connection pool (simplified for single-threaded SQLite)
pub fn create_pool(db_path: &str) -> SqliteResult<DbPool> {
    let conn = Connection::open(db_path)?;
    init::initialize_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Create an in-memory database for testing
pub fn create_test_pool() -> DbPool {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory DB");
    init::initialize_database(&conn).expect("Failed to initialize DB");
    Arc::new(Mutex::new(conn))
}

/// True for persistence failures worth retrying with bounded backoff.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// A message still in `sent` state addressed to a user, surfaced by the
/// reconnect sweep.
#[derive(Debug, Clone)]
pub struct PendingInbound {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email_hash: row.get(2)?,
        password_hash: row.get(3)?,
        is_online: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, message_type, status, is_read, delivered_at, read_at, created_at";

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let type_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        message_type: MessageType::from_str(&type_str).unwrap_or(MessageType::Text),
        status: MessageStatus::from_str(&status_str).unwrap_or(MessageStatus::Sent),
        is_read: row.get::<_, i64>(6)? != 0,
        read_by: Vec::new(),
        delivered_at: row.get(7)?,
        read_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn read_by_for(conn: &Connection, message_id: &str) -> SqliteResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY read_at")?;
    let readers = stmt
        .query_map(params![message_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(readers)
}

fn unread_map_for(conn: &Connection, conversation_id: &str) -> SqliteResult<HashMap<String, i64>> {
    let mut stmt =
        conn.prepare("SELECT user_id, count FROM conversation_unread WHERE conversation_id = ?1")?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (user_id, count) = row?;
        map.insert(user_id, count);
    }
    Ok(map)
}

fn conversation_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_id: row.get(3)?,
        last_message_content: row.get(4)?,
        last_message_time: row.get(5)?,
        unread_count: HashMap::new(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const CONVERSATION_COLUMNS: &str = "id, participant_a, participant_b, last_message_id, \
     last_message_content, last_message_time, created_at, updated_at";

/// Conversation pairs are stored lexicographically normalized so one row
/// exists per unordered pair regardless of who initiated.
fn normalize_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Database operations
pub struct Database;

impl Database {
    /// Create a user row. User provisioning belongs to the external auth
    /// service; this is the bootstrap hook it (and the tests) use.
    pub async fn create_user(
        pool: &DbPool,
        username: &str,
        email_hash: &str,
        password_hash: &str,
    ) -> SqliteResult<User> {
        let conn = pool.lock().await;
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO users (id, username, email_hash, password_hash, is_online, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, username, email_hash, password_hash, &created_at],
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, username, email_hash, password_hash, is_online, created_at
             FROM users WHERE id = ?1",
        )?;
        let user = stmt.query_row(params![id], user_from_row)?;

        Ok(user)
    }

    /// Get user by username
    pub async fn get_user(pool: &DbPool, username: &str) -> SqliteResult<Option<User>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(
            "SELECT id, username, email_hash, password_hash, is_online, created_at
             FROM users WHERE username = ?1",
        )?;

        let user = stmt.query_row(params![username], user_from_row).optional()?;

        Ok(user)
    }

    /// Get user by ID
    pub async fn get_user_by_id(pool: &DbPool, user_id: &str) -> SqliteResult<Option<User>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(
            "SELECT id, username, email_hash, password_hash, is_online, created_at
             FROM users WHERE id = ?1",
        )?;

        let user = stmt.query_row(params![user_id], user_from_row).optional()?;

        Ok(user)
    }

    /// Persist the eventually-consistent mirror of the presence registry.
    pub async fn set_user_online(pool: &DbPool, user_id: &str, online: bool) -> SqliteResult<()> {
        let conn = pool.lock().await;
        conn.execute(
            "UPDATE users SET is_online = ?2 WHERE id = ?1",
            params![user_id, online as i64],
        )?;
        Ok(())
    }

    /// Create a conversation between two distinct users, seeding both
    /// unread counters at zero.
    pub async fn create_conversation(pool: &DbPool, a: &str, b: &str) -> SqliteResult<Conversation> {
        let mut conn = pool.lock().await;
        let (first, second) = normalize_pair(a, b);
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, participant_a, participant_b, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, first, second, &now],
        )?;
        tx.execute(
            "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 0)",
            params![id, first],
        )?;
        tx.execute(
            "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 0)",
            params![id, second],
        )?;
        tx.commit()?;

        let conv =
            Self::load_conversation(&conn, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok(conv)
    }

    fn load_conversation(conn: &Connection, id: &str) -> SqliteResult<Option<Conversation>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
        ))?;
        let conv = stmt.query_row(params![id], conversation_from_row).optional()?;

        match conv {
            Some(mut c) => {
                c.unread_count = unread_map_for(conn, &c.id)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    /// Get conversation by id, unread counters included
    pub async fn get_conversation(pool: &DbPool, id: &str) -> SqliteResult<Option<Conversation>> {
        let conn = pool.lock().await;
        Self::load_conversation(&conn, id)
    }

    /// Get the conversation between two users, if one exists
    pub async fn get_conversation_by_pair(
        pool: &DbPool,
        a: &str,
        b: &str,
    ) -> SqliteResult<Option<Conversation>> {
        let conn = pool.lock().await;
        let (first, second) = normalize_pair(a, b);

        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_a = ?1 AND participant_b = ?2"
        ))?;
        let conv = stmt
            .query_row(params![first, second], conversation_from_row)
            .optional()?;

        match conv {
            Some(mut c) => {
                c.unread_count = unread_map_for(&conn, &c.id)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    /// All conversations a user participates in, most recently active first
    pub async fn list_conversations_for(
        pool: &DbPool,
        user_id: &str,
    ) -> SqliteResult<Vec<Conversation>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_a = ?1 OR participant_b = ?1
             ORDER BY updated_at DESC"
        ))?;
        let mut conversations = stmt
            .query_map(params![user_id], conversation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for conv in &mut conversations {
            conv.unread_count = unread_map_for(&conn, &conv.id)?;
        }

        Ok(conversations)
    }

    /// Persist a new message and, in the same transaction, refresh the
    /// conversation preview and bump the recipient's unread counter.
    /// Returns the stored message and the recipient's new unread count.
    pub async fn record_message(
        pool: &DbPool,
        conversation_id: &str,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> SqliteResult<(Message, i64)> {
        let mut conn = pool.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, status, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'sent', 0, ?6)",
            params![id, conversation_id, sender_id, content, message_type.as_str(), &now],
        )?;
        tx.execute(
            "UPDATE conversations
             SET last_message_id = ?1, last_message_content = ?2, last_message_time = ?3, updated_at = ?3
             WHERE id = ?4",
            params![id, content, &now, conversation_id],
        )?;
        tx.execute(
            "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 1)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = count + 1",
            params![conversation_id, recipient_id],
        )?;
        let recipient_unread: i64 = tx.query_row(
            "SELECT count FROM conversation_unread WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, recipient_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        let message = Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            message_type,
            status: MessageStatus::Sent,
            is_read: false,
            read_by: Vec::new(),
            delivered_at: None,
            read_at: None,
            created_at: now,
        };

        Ok((message, recipient_unread))
    }

    /// Get a message by id, read receipts included
    pub async fn get_message(pool: &DbPool, message_id: &str) -> SqliteResult<Option<Message>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))?;
        let message = stmt
            .query_row(params![message_id], message_from_row)
            .optional()?;
        drop(stmt);

        match message {
            Some(mut m) => {
                m.read_by = read_by_for(&conn, &m.id)?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// Advance a message from `sent` to `delivered`. Returns false when the
    /// message is missing or a later transition already superseded it.
    pub async fn mark_delivered(
        pool: &DbPool,
        message_id: &str,
        delivered_at: &str,
    ) -> SqliteResult<bool> {
        let conn = pool.lock().await;
        let changed = conn.execute(
            "UPDATE messages SET status = 'delivered', delivered_at = ?2
             WHERE id = ?1 AND status = 'sent'",
            params![message_id, delivered_at],
        )?;
        Ok(changed > 0)
    }

    /// Transition a message to `read` on behalf of `reader_id`, recording
    /// the receipt and decrementing the reader's unread counter, all in one
    /// transaction. Returns None (and commits nothing) when the message is
    /// unknown, sent by the reader, or already read by the reader.
    pub async fn mark_read(
        pool: &DbPool,
        message_id: &str,
        reader_id: &str,
        read_at: &str,
    ) -> SqliteResult<Option<Message>> {
        let mut conn = pool.lock().await;
        let tx = conn.transaction()?;

        let message = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
            ))?;
            stmt.query_row(params![message_id], message_from_row)
                .optional()?
        };
        let Some(message) = message else {
            return Ok(None);
        };
        // Senders never appear in their own read set.
        if message.sender_id == reader_id {
            return Ok(None);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
            params![message_id, reader_id, read_at],
        )?;
        if inserted == 0 {
            // Already read by this user; idempotent no-op.
            return Ok(None);
        }

        tx.execute(
            "UPDATE messages
             SET status = 'read', is_read = 1,
                 delivered_at = COALESCE(delivered_at, ?2), read_at = ?2
             WHERE id = ?1",
            params![message_id, read_at],
        )?;
        tx.execute(
            "UPDATE conversation_unread SET count = count - 1
             WHERE conversation_id = ?1 AND user_id = ?2 AND count > 0",
            params![message.conversation_id, reader_id],
        )?;

        let updated =
            Self::load_message_tx(&tx, message_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;

        Ok(Some(updated))
    }

    fn load_message_tx(tx: &Transaction, message_id: &str) -> SqliteResult<Option<Message>> {
        let message = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
            ))?;
            stmt.query_row(params![message_id], message_from_row)
                .optional()?
        };
        match message {
            Some(mut m) => {
                m.read_by = read_by_for(tx, &m.id)?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// Transition every unread inbound message of a conversation to `read`
    /// for one reader and zero their counter, in one transaction. Returns
    /// the messages that actually transitioned (empty on repeat calls).
    pub async fn mark_all_read(
        pool: &DbPool,
        conversation_id: &str,
        reader_id: &str,
        read_at: &str,
    ) -> SqliteResult<Vec<Message>> {
        let mut conn = pool.lock().await;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT m.id FROM messages m
                 WHERE m.conversation_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM message_reads r
                       WHERE r.message_id = m.id AND r.user_id = ?2
                   )
                 ORDER BY m.created_at",
            )?;
            let rows = stmt
                .query_map(params![conversation_id, reader_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![id, reader_id, read_at],
            )?;
            tx.execute(
                "UPDATE messages
                 SET status = 'read', is_read = 1,
                     delivered_at = COALESCE(delivered_at, ?2), read_at = ?2
                 WHERE id = ?1",
                params![id, read_at],
            )?;
            let message =
                Self::load_message_tx(&tx, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            updated.push(message);
        }

        tx.execute(
            "UPDATE conversation_unread SET count = 0
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, reader_id],
        )?;
        tx.commit()?;

        Ok(updated)
    }

    /// Messages still `sent` and addressed to this user across all their
    /// conversations; drives the delivered sweep on reconnect.
    pub async fn pending_inbound_for(
        pool: &DbPool,
        user_id: &str,
    ) -> SqliteResult<Vec<PendingInbound>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(
            "SELECT m.id, m.conversation_id, m.sender_id FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE (c.participant_a = ?1 OR c.participant_b = ?1)
               AND m.sender_id != ?1 AND m.status = 'sent'
             ORDER BY m.created_at",
        )?;
        let pending = stmt
            .query_map(params![user_id], |row| {
                Ok(PendingInbound {
                    message_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(pending)
    }

    /// Bulk sent -> delivered transition for the reconnect sweep.
    pub async fn mark_delivered_bulk(
        pool: &DbPool,
        message_ids: &[String],
        delivered_at: &str,
    ) -> SqliteResult<usize> {
        let mut conn = pool.lock().await;
        let tx = conn.transaction()?;

        let mut changed = 0;
        for id in message_ids {
            changed += tx.execute(
                "UPDATE messages SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status = 'sent'",
                params![id, delivered_at],
            )?;
        }
        tx.commit()?;

        Ok(changed)
    }

    /// Messages of a conversation, newest first
    pub async fn list_messages(
        pool: &DbPool,
        conversation_id: &str,
        limit: i64,
    ) -> SqliteResult<Vec<Message>> {
        let conn = pool.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let mut messages = stmt
            .query_map(params![conversation_id, limit], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for message in &mut messages {
            message.read_by = read_by_for(&conn, &message.id)?;
        }

        Ok(messages)
    }

    /// A single participant's unread counter (0 when no row exists)
    pub async fn unread_count(
        pool: &DbPool,
        conversation_id: &str,
        user_id: &str,
    ) -> SqliteResult<i64> {
        let conn = pool.lock().await;

        let count = conn
            .query_row(
                "SELECT count FROM conversation_unread WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0))
    }
}
