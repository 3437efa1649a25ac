//! Session management layer
//!
//! A `Session` is the per-id handle: process, attached client, output
//! buffer, message history and inferred CLI state. `SessionRegistry` owns
//! all sessions and drives their lifecycle.

mod registry;

pub use registry::{ConnectRequest, Connection, SessionRegistry};

use crate::parser::{classify, Classification, StreamParser};
use crate::protocol::ServerEvent;
use crate::pty::{OutputBuffer, ProcessHandle};
use crate::scheduler::BackoffTarget;
use crate::state::{CliState, SessionPhase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Failed to start session: {0}")]
    Spawn(String),
    #[error("Process error: {0}")]
    Process(String),
    #[error("Session has no running process: {0}")]
    Dead(String),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Store error: {0}")]
    Store(String),
}

impl From<crate::store::StoreError> for SessionError {
    fn from(e: crate::store::StoreError) -> Self {
        SessionError::Store(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<crate::store::MessageRecord> for ChatMessage {
    fn from(record: crate::store::MessageRecord) -> Self {
        Self {
            role: record.role,
            content: record.content,
            timestamp: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: String,
    pub phase: SessionPhase,
    pub state: CliState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub process_alive: bool,
    pub client_attached: bool,
    pub via_multiplexer: bool,
    pub multiplexer_name: String,
    pub buffer_size: usize,
    pub message_count: usize,
    pub backoff_pending: usize,
    pub idle_seconds: u64,
    pub stuck: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub project_path: String,
    pub multiplexer_name: String,
    pub phase: SessionPhase,
    pub state: CliState,
    pub client_attached: bool,
    pub idle_seconds: u64,
}

/// Outbound half of an attached socket
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ClientHandle {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns false once the socket side has gone away
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// How a process came to be behind a session after `ensure_process`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOrigin {
    /// The existing handle was still alive
    Reused,
    /// Attached to a multiplexer session that was already running
    Attached,
    /// A new process or multiplexer session was started
    Created,
}

pub struct Session {
    pub id: String,
    pub project_path: PathBuf,
    pub multiplexer_name: String,
    phase: RwLock<SessionPhase>,
    process: RwLock<Option<Arc<dyn ProcessHandle>>>,
    /// Bumped on every process install so a stale pump can tell it was replaced
    process_epoch: AtomicU64,
    via_multiplexer: AtomicBool,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    client: std::sync::Mutex<Option<ClientHandle>>,
    buffer: Mutex<OutputBuffer>,
    messages: Mutex<Vec<ChatMessage>>,
    classification: RwLock<Classification>,
    last_activity: std::sync::Mutex<Instant>,
    last_output: std::sync::Mutex<Instant>,
    dirty: AtomicBool,
    tail_window: usize,

    // Serializes connect, detach, kill and exit handling
    lifecycle_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        id: String,
        project_path: PathBuf,
        multiplexer_name: String,
        max_buffer: usize,
        tail_window: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            project_path,
            multiplexer_name,
            phase: RwLock::new(SessionPhase::Creating),
            process: RwLock::new(None),
            process_epoch: AtomicU64::new(0),
            via_multiplexer: AtomicBool::new(false),
            pump: std::sync::Mutex::new(None),
            client: std::sync::Mutex::new(None),
            buffer: Mutex::new(OutputBuffer::new(max_buffer)),
            messages: Mutex::new(Vec::new()),
            classification: RwLock::new(Classification {
                state: CliState::Unknown,
                tool: None,
            }),
            last_activity: std::sync::Mutex::new(now),
            last_output: std::sync::Mutex::new(now),
            dirty: AtomicBool::new(false),
            tail_window,
            lifecycle_lock: Mutex::new(()),
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        *self.phase.read().await
    }

    pub async fn classification(&self) -> Classification {
        self.classification.read().await.clone()
    }

    pub async fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.process.read().await.clone()
    }

    pub async fn process_alive(&self) -> bool {
        match self.process().await {
            Some(handle) => handle.is_alive().await,
            None => false,
        }
    }

    pub fn via_multiplexer(&self) -> bool {
        self.via_multiplexer.load(Ordering::SeqCst)
    }

    pub fn has_client(&self) -> bool {
        self.client.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn silent_for(&self) -> std::time::Duration {
        self.last_output
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub async fn buffer_snapshot(&self) -> String {
        self.buffer.lock().await.as_str().to_string()
    }

    pub async fn buffer_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    pub(crate) async fn push_message(&self, message: ChatMessage) {
        self.messages.lock().await.push(message);
    }

    /// Repopulate buffer and history from the store before any client traffic
    pub(crate) async fn restore(&self, output: Option<&str>, messages: Vec<ChatMessage>) {
        if let Some(output) = output {
            let mut buffer = self.buffer.lock().await;
            let limit = buffer.limit();
            *buffer = OutputBuffer::restore(output, limit);
        }
        if !messages.is_empty() {
            *self.messages.lock().await = messages;
        }
    }

    pub(crate) async fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write().await = phase;
    }

    pub(crate) fn phase_lock(&self) -> &RwLock<SessionPhase> {
        &self.phase
    }

    pub(crate) fn lifecycle_lock(&self) -> &Mutex<()> {
        &self.lifecycle_lock
    }

    pub(crate) fn process_epoch(&self) -> u64 {
        self.process_epoch.load(Ordering::SeqCst)
    }

    /// Install a new process handle; returns its epoch
    pub(crate) async fn install_process(
        &self,
        handle: Arc<dyn ProcessHandle>,
        via_multiplexer: bool,
    ) -> u64 {
        let mut process = self.process.write().await;
        *process = Some(handle);
        self.via_multiplexer.store(via_multiplexer, Ordering::SeqCst);
        self.process_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        if let Ok(mut pump) = self.pump.lock() {
            // A previous pump for a dead handle just finishes on its own
            *pump = Some(handle);
        }
    }

    /// Forget the process without touching the pump that may be calling us
    pub(crate) async fn drop_process(&self) -> Option<Arc<dyn ProcessHandle>> {
        if let Ok(mut pump) = self.pump.lock() {
            pump.take();
        }
        self.process.write().await.take()
    }

    /// Stop the output pump and forget the process
    pub(crate) async fn take_process(&self) -> Option<Arc<dyn ProcessHandle>> {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        self.process.write().await.take()
    }

    /// Bind a client, send `connected` and replay the buffer once.
    ///
    /// Holds the buffer lock so no live chunk lands between the replay and
    /// the first live `output` event.
    pub(crate) async fn bind_client(
        &self,
        client: ClientHandle,
        connected: ServerEvent,
        replay: bool,
    ) {
        let buffer = self.buffer.lock().await;
        client.send(connected);
        if replay && !buffer.is_empty() {
            client.send(ServerEvent::OutputBuffer {
                data: buffer.as_str().to_string(),
            });
        }
        let state = self.classification.read().await.clone();
        client.send(ServerEvent::StateChange {
            state: state.state,
            tool: state.tool,
        });

        let previous = match self.client.lock() {
            Ok(mut slot) => slot.replace(client),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            tracing::info!(
                "Session {}: client {} replaced by a newer connection",
                self.id,
                previous.id()
            );
        }
    }

    /// Remove the client if it is still the one identified by `client_id`
    pub(crate) fn unbind_client_if(&self, client_id: u64) -> bool {
        match self.client.lock() {
            Ok(mut slot) if slot.as_ref().map(|c| c.id()) == Some(client_id) => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn unbind_client(&self) -> Option<ClientHandle> {
        self.client.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Send to the attached client; returns false when nobody is attached
    pub fn notify(&self, event: ServerEvent) -> bool {
        let client = self.client.lock().ok().and_then(|slot| slot.clone());
        match client {
            Some(client) => client.send(event),
            None => false,
        }
    }

    /// Append a raw output chunk, relay it and reclassify.
    ///
    /// Returns the new classification when it changed.
    pub(crate) async fn ingest(
        &self,
        chunk: &[u8],
        parser: &mut StreamParser,
    ) -> Option<Classification> {
        let mut buffer = self.buffer.lock().await;
        let text = buffer.push_bytes(chunk);
        if text.is_empty() {
            return None;
        }
        self.dirty.store(true, Ordering::SeqCst);
        if let Ok(mut at) = self.last_output.lock() {
            *at = Instant::now();
        }

        let classification = classify(buffer.tail(self.tail_window));
        let events = parser.feed(&text);

        // Still under the buffer lock, see `bind_client`
        let client = self.client.lock().ok().and_then(|slot| slot.clone());
        if let Some(client) = client {
            client.send(ServerEvent::Output { data: text });
            for event in events {
                client.send(event.into());
            }
        }
        drop(buffer);

        self.update_classification(classification).await
    }

    /// Store a classification; returns it when the state or tool changed
    pub(crate) async fn update_classification(
        &self,
        classification: Classification,
    ) -> Option<Classification> {
        let mut current = self.classification.write().await;
        if *current == classification {
            return None;
        }
        tracing::debug!(
            "Session {}: {} -> {}{}",
            self.id,
            current.state,
            classification.state,
            classification
                .tool
                .as_deref()
                .map(|t| format!(" ({})", t))
                .unwrap_or_default()
        );
        *current = classification.clone();
        drop(current);

        self.notify(ServerEvent::StateChange {
            state: classification.state,
            tool: classification.tool.clone(),
        });
        Some(classification)
    }

    /// Snapshot of the buffer if it changed since the last flush.
    ///
    /// Clears the dirty flag; callers restore it with `mark_dirty` when the
    /// write fails.
    pub(crate) async fn take_dirty_snapshot(&self, force: bool) -> Option<String> {
        let was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        if !was_dirty && !force {
            return None;
        }
        Some(self.buffer_snapshot().await)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub async fn status(&self, backoff_pending: usize, stuck_threshold: Option<std::time::Duration>) -> StatusReport {
        let classification = self.classification().await;
        let phase = self.phase().await;
        let silent = self.silent_for();
        let stuck = stuck_threshold.is_some_and(|t| {
            classification.state == CliState::Responding && self.has_client() && silent > t
        });
        StatusReport {
            session_id: self.id.clone(),
            phase,
            state: classification.state,
            tool: classification.tool,
            process_alive: self.process_alive().await,
            client_attached: self.has_client(),
            via_multiplexer: self.via_multiplexer(),
            multiplexer_name: self.multiplexer_name.clone(),
            buffer_size: self.buffer_len().await,
            message_count: self.messages.lock().await.len(),
            backoff_pending,
            idle_seconds: silent.as_secs(),
            stuck,
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            project_path: self.project_path.display().to_string(),
            multiplexer_name: self.multiplexer_name.clone(),
            phase: self.phase().await,
            state: self.classification().await.state,
            client_attached: self.has_client(),
            idle_seconds: self.idle_for().as_secs(),
        }
    }
}

#[async_trait]
impl BackoffTarget for Session {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn cli_state(&self) -> CliState {
        self.classification.read().await.state
    }

    async fn send_enter(&self) -> anyhow::Result<()> {
        match self.process().await {
            Some(handle) => handle.write(b"\r").await,
            None => anyhow::bail!("no process attached"),
        }
    }
}
