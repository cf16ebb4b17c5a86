//! Conversation store
//!
//! Persists finalized conversation snapshots. The connection handle is
//! owned explicitly and passed to whoever needs it; there is no
//! process-wide connection cache.

mod schema;

pub use schema::*;

use crate::conversation::{Conversation, Message, Role, EMPTY_PREVIEW};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> DbResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> DbResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // ==================== Conversation Operations ====================

    /// Create a new, empty conversation
    pub fn create_conversation(&self, id: &str, owner_id: &str) -> DbResult<Conversation> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (id, owner_id, preview, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, owner_id, EMPTY_PREVIEW, now.to_rfc3339()],
        )?;

        Ok(Conversation::new(id, owner_id, now))
    }

    /// Replace the stored log with the snapshot's finalized messages
    pub fn save_snapshot(&self, conversation: &Conversation) -> DbResult<()> {
        let snapshot = conversation.snapshot();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, owner_id, preview, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET preview = excluded.preview, updated_at = excluded.updated_at",
            params![
                snapshot.id,
                snapshot.owner_id,
                snapshot.preview(),
                snapshot.created_at.to_rfc3339(),
                snapshot.updated_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![snapshot.id],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (conversation_id, position, role, content, image_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, message) in snapshot.messages().iter().enumerate() {
                stmt.execute(params![
                    snapshot.id,
                    i64::try_from(position).map_err(|e| DbError::Corrupt(e.to_string()))?,
                    message.role.as_str(),
                    message.content,
                    message.image_ref,
                    message.created_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load a conversation with its messages
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.lock()?;

        let (owner_id, created_at, updated_at) = conn
            .query_row(
                "SELECT owner_id, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })?;

        let mut stmt = conn.prepare(
            "SELECT role, content, image_ref, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let messages = rows
            .into_iter()
            .map(|(role, content, image_ref, created_at)| {
                let role = Role::parse(&role).ok_or_else(|| DbError::Corrupt(format!("unknown role {role:?}")))?;
                Ok(Message {
                    role,
                    content,
                    image_ref,
                    created_at: parse_datetime(&created_at),
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        Ok(Conversation::from_parts(
            id.to_string(),
            owner_id,
            messages,
            parse_datetime(&created_at),
            parse_datetime(&updated_at),
        ))
    }

    /// List an owner's conversations, most recently updated first
    pub fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<ConversationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, preview, updated_at FROM conversations
             WHERE owner_id = ?1 ORDER BY updated_at DESC, created_at DESC",
        )?;

        let summaries = stmt
            .query_map(params![owner_id], |row| {
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    preview: row.get(1)?,
                    updated_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
