//! In-memory session store, nothing survives a restart

use super::{MessageRecord, OutputRecord, SessionRecord, SessionStore, StoreError};
use crate::pty::buffer::tail_chars;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    outputs: HashMap<String, OutputRecord>,
    messages: Vec<MessageRecord>,
    next_message_id: i64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_output: usize,
}

impl MemoryStore {
    pub fn new(max_output: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_output,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let mut record = record.clone();
        if let Some(existing) = inner.sessions.get(&record.session_id) {
            record.created_at = existing.created_at;
        }
        inner.sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock()?.sessions.get(session_id).cloned())
    }

    async fn touch_session(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.sessions.get_mut(session_id) {
            if record.is_active {
                record.last_activity_at = at;
            }
        }
        Ok(())
    }

    async fn mark_inactive(&self, session_id: &str) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.sessions.get_mut(session_id) {
            record.is_active = false;
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.sessions.remove(session_id);
        inner.outputs.remove(session_id);
        inner.messages.retain(|m| m.session_id != session_id);
        Ok(())
    }

    async fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StoreError> {
        let mut sessions: Vec<SessionRecord> = self
            .lock()?
            .sessions
            .values()
            .filter(|r| !active_only || r.is_active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn save_output(&self, session_id: &str, output: &str) -> Result<(), StoreError> {
        let record = OutputRecord {
            session_id: session_id.to_string(),
            output: tail_chars(output, self.max_output).to_string(),
            updated_at: Utc::now(),
        };
        self.lock()?.outputs.insert(session_id.to_string(), record);
        Ok(())
    }

    async fn load_output(&self, session_id: &str) -> Result<Option<OutputRecord>, StoreError> {
        Ok(self.lock()?.outputs.get(session_id).cloned())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let mut inner = self.lock()?;
        inner.next_message_id += 1;
        let record = MessageRecord {
            id: inner.next_message_id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.push(record.clone());
        Ok(record)
    }

    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock()?;
        let matching: Vec<MessageRecord> = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        let skip = limit
            .map(|l| matching.len().saturating_sub(l))
            .unwrap_or(0);
        Ok(matching.into_iter().skip(skip).collect())
    }
}
