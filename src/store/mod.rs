//! Persistence gateway
//!
//! Durable session metadata, the last output snapshot of every session and
//! its append-only message history. The registry only talks to the
//! `SessionStore` trait; `SqliteStore` is the on-disk backend and
//! `MemoryStore` backs tests and `--no-persist`.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
    pub multiplexer_name: String,
}

impl SessionRecord {
    pub fn new(session_id: &str, project_path: &str, multiplexer_name: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            project_path: project_path.to_string(),
            created_at: now,
            last_activity_at: now,
            is_active: true,
            multiplexer_name: multiplexer_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub session_id: String,
    pub output: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Store connection poisoned")]
    Poisoned,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or update session metadata. `created_at` of an existing row is kept.
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Bump `last_activity_at` of an active session. Inactive sessions are left alone.
    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn mark_inactive(&self, session_id: &str) -> Result<(), StoreError>;

    /// Remove metadata, output and history of a session
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    async fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StoreError>;

    /// Replace the output snapshot. Longer output keeps only its trailing part.
    async fn save_output(&self, session_id: &str, output: &str) -> Result<(), StoreError>;

    async fn load_output(&self, session_id: &str) -> Result<Option<OutputRecord>, StoreError>;

    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError>;

    /// Most recent `limit` messages (all when `None`), oldest first
    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError>;
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
