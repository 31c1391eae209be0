use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db;
use crate::error::Result;
use crate::types::{DocumentRecord, MessageRecord, SessionInfo, SessionRecord, UserRecord};

/// Thread-safe store handle.
///
/// Wraps a single SQLite connection in a `Mutex`. Concurrent appends from
/// one process serialize on the lock; cross-process safety is out of scope.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub fn get_or_create_user(&self, username: &str) -> Result<UserRecord> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            rusqlite::params![username],
        )?;
        // Read back — also covers the race where two threads insert at once.
        let user = conn.query_row(
            "SELECT id, username, password_hash, memory FROM users WHERE username = ?1",
            rusqlite::params![username],
            row_to_user,
        )?;
        Ok(user)
    }

    pub fn register_user(&self, username: &str, password_hash: Option<&str>) -> Result<UserRecord> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            rusqlite::params![username, password_hash],
        )?;
        let user = conn.query_row(
            "SELECT id, username, password_hash, memory FROM users WHERE username = ?1",
            rusqlite::params![username],
            row_to_user,
        )?;
        Ok(user)
    }

    /// Look up an existing user without creating one.
    pub fn find_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, memory FROM users WHERE username = ?1",
                rusqlite::params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn get_or_create_session(&self, user_id: i64, name: &str) -> Result<SessionRecord> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (user_id, name, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, name, now],
        )?;
        let session = conn.query_row(
            "SELECT id, user_id, name, created_at FROM sessions
             WHERE user_id = ?1 AND name = ?2",
            rusqlite::params![user_id, name],
            row_to_session,
        )?;
        Ok(session)
    }

    pub fn list_sessions(&self, username: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.name FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE u.username = ?1
             ORDER BY s.created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![username], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Session names with a snippet of the most recent message each.
    pub fn list_sessions_info(&self, username: &str) -> Result<Vec<SessionInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.name,
                    (SELECT m.content FROM messages m
                     WHERE m.session_id = s.id
                     ORDER BY m.created_at DESC, m.id DESC LIMIT 1)
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE u.username = ?1
             ORDER BY s.created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![username], |row| {
            let name: String = row.get(0)?;
            let last: Option<String> = row.get(1)?;
            Ok(SessionInfo {
                name,
                last_message: last.map(|c| snippet(&c, 50)).unwrap_or_default(),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Remove all messages for `username`'s session `name`, the session row
    /// itself, and the user row when no other sessions remain. Returns the
    /// number of deleted messages.
    pub fn delete_history(&self, username: &str, session_name: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let ids: Option<(i64, i64)> = conn
            .query_row(
                "SELECT u.id, s.id FROM sessions s
                 JOIN users u ON u.id = s.user_id
                 WHERE u.username = ?1 AND s.name = ?2",
                rusqlite::params![username, session_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((user_id, session_id)) = ids else {
            return Ok(0);
        };

        let deleted = conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        conn.execute(
            "DELETE FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
        )?;

        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            conn.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![user_id])?;
        }

        debug!(username, session_name, deleted, "history deleted");
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn append_message(&self, session_id: i64, role: &str, content: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id, role, content, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All messages of a session, ordered by timestamp (insertion order as
    /// tiebreak for identical timestamps).
    pub fn list_messages(&self, session_id: i64) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -----------------------------------------------------------------------
    // Memory blob
    // -----------------------------------------------------------------------

    /// Raw memory blob for `username` (may be empty).
    pub fn load_memory(&self, username: &str) -> Result<String> {
        let user = self.get_or_create_user(username)?;
        Ok(user.memory)
    }

    /// Persist `memory` for `username`, truncating to `limit` bytes on a
    /// character boundary.
    pub fn store_memory(&self, username: &str, memory: &str, limit: usize) -> Result<String> {
        let mut memory = memory.trim().to_string();
        if memory.len() > limit {
            let mut cut = limit;
            while cut > 0 && !memory.is_char_boundary(cut) {
                cut -= 1;
            }
            memory.truncate(cut);
        }
        self.get_or_create_user(username)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET memory = ?1 WHERE username = ?2",
            rusqlite::params![memory, username],
        )?;
        Ok(memory)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub fn add_document(
        &self,
        username: &str,
        file_path: &str,
        original_name: &str,
    ) -> Result<DocumentRecord> {
        let user = self.get_or_create_user(username)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (user_id, file_path, original_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user.id, file_path, original_name, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(DocumentRecord {
            id,
            file_path: file_path.to_string(),
            original_name: original_name.to_string(),
            created_at: now,
        })
    }

    pub fn list_documents(&self, username: &str) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.file_path, d.original_name, d.created_at
             FROM documents d
             JOIN users u ON u.id = d.user_id
             WHERE u.username = ?1
             ORDER BY d.created_at, d.id",
        )?;
        let rows = stmt.query_map(rusqlite::params![username], |row| {
            Ok(DocumentRecord {
                id: row.get(0)?,
                file_path: row.get(1)?,
                original_name: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        memory: row.get(3)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn snippet(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let head: String = content.chars().take(max_chars).collect();
    format!("{head}…")
}
