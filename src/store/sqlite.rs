//! SQLite-backed session store

use super::{
    from_millis, to_millis, MessageRecord, OutputRecord, SessionRecord, SessionStore, StoreError,
};
use crate::pty::buffer::tail_chars;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  session_id TEXT PRIMARY KEY,
  project_path TEXT NOT NULL,
  multiplexer_name TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL,
  last_activity_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(is_active);

CREATE TABLE IF NOT EXISTS session_output (
  session_id TEXT PRIMARY KEY,
  output TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_output: usize,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn open<P: AsRef<Path>>(db_path: P, max_output: usize) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::info!("Opened session store at {}", db_path.display());
        Self::init(conn, max_output)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory(max_output: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, max_output)
    }

    fn init(conn: Connection, max_output: usize) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_output,
        })
    }

    /// Run a blocking database call off the async runtime
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
        let is_active: i64 = row.get("is_active")?;
        Ok(SessionRecord {
            session_id: row.get("session_id")?,
            project_path: row.get("project_path")?,
            multiplexer_name: row.get("multiplexer_name")?,
            is_active: is_active == 1,
            created_at: from_millis(row.get("created_at")?),
            last_activity_at: from_millis(row.get("last_activity_at")?),
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: row.get("role")?,
            content: row.get("content")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, project_path, multiplexer_name, is_active, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                   project_path = excluded.project_path,
                   multiplexer_name = excluded.multiplexer_name,
                   is_active = excluded.is_active,
                   last_activity_at = excluded.last_activity_at",
                params![
                    record.session_id,
                    record.project_path,
                    record.multiplexer_name,
                    if record.is_active { 1 } else { 0 },
                    to_millis(record.created_at),
                    to_millis(record.last_activity_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()
        })
        .await
    }

    async fn touch_session(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?2 WHERE session_id = ?1 AND is_active = 1",
                params![session_id, to_millis(at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_inactive(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute(
                "DELETE FROM session_output WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StoreError> {
        self.with_conn(move |conn| {
            let sql = if active_only {
                "SELECT * FROM sessions WHERE is_active = 1 ORDER BY last_activity_at DESC"
            } else {
                "SELECT * FROM sessions ORDER BY last_activity_at DESC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], Self::row_to_session)?;

            let mut sessions = Vec::new();
            for session in rows {
                sessions.push(session?);
            }
            Ok(sessions)
        })
        .await
    }

    async fn save_output(&self, session_id: &str, output: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let output = tail_chars(output, self.max_output).to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO session_output (session_id, output, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET output = excluded.output, updated_at = excluded.updated_at",
                params![session_id, output, to_millis(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_output(&self, session_id: &str) -> Result<Option<OutputRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT session_id, output, updated_at FROM session_output WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(OutputRecord {
                        session_id: row.get(0)?,
                        output: row.get(1)?,
                        updated_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let session_id = session_id.to_string();
        let role = role.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, role, content, to_millis(created_at)],
            )?;
            Ok(MessageRecord {
                id: conn.last_insert_rowid(),
                session_id,
                role,
                content,
                created_at: from_millis(to_millis(created_at)),
            })
        })
        .await
    }

    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let session_id = session_id.to_string();
        // Negative LIMIT means no limit in SQLite
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM (
                   SELECT * FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id, limit], Self::row_to_message)?;

            let mut messages = Vec::new();
            for message in rows {
                messages.push(message?);
            }
            Ok(messages)
        })
        .await
    }
}
