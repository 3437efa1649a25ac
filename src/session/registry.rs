use super::{
    ChatMessage, ClientHandle, ProcessOrigin, Session, SessionError, SessionSummary, StatusReport,
};
use crate::config::SessionConfig;
use crate::parser::{Classification, StreamParser};
use crate::protocol::ServerEvent;
use crate::pty::{ProcessHandle, Supervisor};
use crate::scheduler::Scheduler;
use crate::state::{CliState, Lifecycle, PhaseEvent, SessionPhase, SideEffect, TransitionResult};
use crate::store::{SessionRecord, SessionStore};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Absent or empty means "create a new session"
    pub session_id: Option<String>,
    pub project_path: Option<PathBuf>,
    /// Type the CLI command into the shell; only honoured for brand-new sessions
    pub start_cli: bool,
}

/// An attached client: the session it is bound to and its event stream
pub struct Connection {
    pub session_id: String,
    pub client_id: u64,
    pub reconnected: bool,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    supervisor: Arc<dyn Supervisor>,
    store: Arc<dyn SessionStore>,
    scheduler: Scheduler,
    config: SessionConfig,
    next_client_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        supervisor: Arc<dyn Supervisor>,
        store: Arc<dyn SessionStore>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            supervisor,
            store,
            scheduler,
            config,
            next_client_id: AtomicU64::new(0),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn require(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn require_process(
        &self,
        session_id: &str,
    ) -> Result<(Arc<Session>, Arc<dyn ProcessHandle>), SessionError> {
        let session = self.require(session_id).await?;
        let handle = session
            .process()
            .await
            .ok_or_else(|| SessionError::Dead(session_id.to_string()))?;
        Ok((session, handle))
    }

    /// Attach a client to a session, creating, restoring or re-attaching
    /// the process behind it as needed.
    pub async fn connect(
        self: &Arc<Self>,
        request: ConnectRequest,
    ) -> Result<Connection, SessionError> {
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let session = match self.get(&session_id).await {
            Some(session) => session,
            None => self.register(&session_id, request.project_path.clone()).await,
        };

        let _lifecycle = session.lifecycle_lock().lock().await;

        let phase = session.phase().await;
        if phase == SessionPhase::Dead {
            return Err(SessionError::Dead(session_id));
        }

        let mut brand_new = false;
        if phase == SessionPhase::Creating {
            let stored = self.restore(&session).await;
            let origin = match self.ensure_process(&session).await {
                Ok(origin) => origin,
                Err(e) => {
                    tracing::error!("Session {}: spawn failed: {}", session_id, e);
                    self.apply_transition(
                        &session,
                        PhaseEvent::SpawnFailed {
                            reason: e.to_string(),
                        },
                    )
                    .await?;
                    return Err(e);
                }
            };
            brand_new = stored.is_none() && origin == ProcessOrigin::Created;

            let mut record = stored.unwrap_or_else(|| {
                SessionRecord::new(
                    &session.id,
                    &session.project_path.display().to_string(),
                    &session.multiplexer_name,
                )
            });
            record.is_active = true;
            record.last_activity_at = Utc::now();
            if let Err(e) = self.store.upsert_session(&record).await {
                tracing::warn!("Session {}: failed to persist metadata: {}", session_id, e);
            }
        } else if !session.process_alive().await {
            tracing::info!("Session {}: process gone, re-attaching", session_id);
            self.ensure_process(&session).await?;
        }

        if brand_new && request.start_cli {
            self.start_cli(&session).await;
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, events) = mpsc::unbounded_channel();
        let client = ClientHandle::new(client_id, tx);
        let reconnected = !brand_new;

        let result = self
            .apply_transition(&session, PhaseEvent::ClientAttached)
            .await?;
        if result.side_effects.contains(&SideEffect::BindClient) {
            let connected = ServerEvent::Connected {
                session_id: session.id.clone(),
                reconnected,
                project_path: session.project_path.display().to_string(),
            };
            let replay = result.side_effects.contains(&SideEffect::ReplayBuffer);
            session.bind_client(client, connected, replay).await;
        }
        session.touch();

        tracing::info!(
            "Session {}: client {} attached (reconnected={})",
            session_id,
            client_id,
            reconnected
        );

        Ok(Connection {
            session_id,
            client_id,
            reconnected,
            events,
        })
    }

    /// Insert a placeholder session in CREATING, or return the one a racing
    /// connect inserted first.
    async fn register(
        &self,
        session_id: &str,
        project_path: Option<PathBuf>,
    ) -> Arc<Session> {
        let stored_path = match self.store.get_session(session_id).await {
            Ok(record) => record.map(|r| PathBuf::from(r.project_path)),
            Err(e) => {
                tracing::warn!("Session {}: store lookup failed: {}", session_id, e);
                None
            }
        };
        let project_path = project_path
            .filter(|p| !p.as_os_str().is_empty())
            .or(stored_path)
            .unwrap_or_else(default_project_path);

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return existing.clone();
        }
        let session = Arc::new(Session::new(
            session_id.to_string(),
            project_path,
            self.supervisor.multiplexer_name(session_id),
            self.config.max_buffer,
            self.config.tail_window,
        ));
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    /// Load stored output and history into a fresh session
    async fn restore(&self, session: &Session) -> Option<SessionRecord> {
        let record = match self.store.get_session(&session.id).await {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!("Session {}: store lookup failed: {}", session.id, e);
                return None;
            }
        };

        let output = match self.store.load_output(&session.id).await {
            Ok(output) => output.map(|o| o.output),
            Err(e) => {
                tracing::warn!("Session {}: failed to load output: {}", session.id, e);
                None
            }
        };
        let messages = match self.store.load_messages(&session.id, None).await {
            Ok(messages) => messages.into_iter().map(ChatMessage::from).collect(),
            Err(e) => {
                tracing::warn!("Session {}: failed to load history: {}", session.id, e);
                Vec::new()
            }
        };

        tracing::info!(
            "Session {}: restored {} chars of output and {} messages",
            session.id,
            output.as_deref().map(|o| o.chars().count()).unwrap_or(0),
            messages.len()
        );
        session.restore(output.as_deref(), messages).await;
        Some(record)
    }

    /// Make sure a live process backs the session. Never spawns a second
    /// process while the current handle is alive.
    async fn ensure_process(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<ProcessOrigin, SessionError> {
        if session.process_alive().await {
            return Ok(ProcessOrigin::Reused);
        }
        if let Some(stale) = session.take_process().await {
            stale.kill().await;
        }

        let outcome = self
            .supervisor
            .spawn_or_attach(&session.id, &session.project_path)
            .await
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let output = outcome
            .handle
            .take_output()
            .ok_or_else(|| SessionError::Spawn("process output already taken".to_string()))?;

        tracing::info!(
            "Session {}: {} process (pid {:?}, multiplexer={})",
            session.id,
            if outcome.attached_existing {
                "attached to"
            } else {
                "started"
            },
            outcome.handle.pid(),
            outcome.via_multiplexer
        );

        let epoch = session
            .install_process(outcome.handle.clone(), outcome.via_multiplexer)
            .await;
        let pump = tokio::spawn(run_pump(self.clone(), session.clone(), epoch, output));
        session.set_pump(pump);

        Ok(if outcome.attached_existing {
            ProcessOrigin::Attached
        } else {
            ProcessOrigin::Created
        })
    }

    async fn start_cli(&self, session: &Session) {
        let command = self.config.cli_command.trim();
        if command.is_empty() {
            return;
        }
        let Some(handle) = session.process().await else {
            return;
        };
        tracing::info!("Session {}: starting `{}`", session.id, command);
        if let Err(e) = handle.write_line(command).await {
            tracing::warn!("Session {}: failed to start CLI: {}", session.id, e);
        }
    }

    async fn apply_transition(
        &self,
        session: &Arc<Session>,
        event: PhaseEvent,
    ) -> Result<TransitionResult, SessionError> {
        let mut phase = session.phase_lock().write().await;
        let current = *phase;
        let result = Lifecycle::transition(current, event.clone())
            .map_err(|e| SessionError::InvalidTransition(e.to_string()))?;
        *phase = result.new_state;
        drop(phase);

        if current != result.new_state {
            tracing::debug!(
                "Session {}: {} --{}--> {}",
                session.id,
                current,
                event,
                result.new_state
            );
        }

        for effect in &result.side_effects {
            self.handle_side_effect(session, effect).await;
        }

        Ok(result)
    }

    async fn handle_side_effect(&self, session: &Arc<Session>, effect: &SideEffect) {
        match effect {
            SideEffect::BindClient | SideEffect::ReplayBuffer => {
                // Done by `connect`, which owns the new client
            }
            SideEffect::FlushBuffer => {
                let _ = self.flush_session(session, true).await;
            }
            SideEffect::CancelBackoff => {
                self.scheduler.cancel(&session.id);
            }
            SideEffect::KillProcess => {
                if let Some(handle) = session.take_process().await {
                    handle.kill().await;
                }
                if session.via_multiplexer() {
                    self.supervisor.kill_multiplexer(&session.id).await;
                }
            }
            SideEffect::DropProcess => {
                session.drop_process().await;
            }
            SideEffect::NotifyClient(message) => {
                session.notify(ServerEvent::error(message.clone()));
            }
            SideEffect::UnbindClient => {
                session.unbind_client();
            }
            SideEffect::RemoveFromRegistry => {
                session.unbind_client();
                let mut sessions = self.sessions.write().await;
                if sessions
                    .get(&session.id)
                    .is_some_and(|s| Arc::ptr_eq(s, session))
                {
                    sessions.remove(&session.id);
                }
                tracing::info!("Session {} removed", session.id);
            }
            SideEffect::MarkInactive => {
                if let Err(e) = self.store.mark_inactive(&session.id).await {
                    tracing::warn!("Session {}: failed to mark inactive: {}", session.id, e);
                }
            }
        }
    }

    /// Detach a client. A client that was already replaced is ignored.
    pub async fn detach(&self, session_id: &str, client_id: u64) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let _lifecycle = session.lifecycle_lock().lock().await;
        if !session.unbind_client_if(client_id) {
            tracing::debug!(
                "Session {}: stale client {} closed, nothing to detach",
                session_id,
                client_id
            );
            return;
        }
        match self
            .apply_transition(&session, PhaseEvent::ClientDetached)
            .await
        {
            Ok(_) => tracing::info!("Session {}: client {} detached", session_id, client_id),
            Err(e) => tracing::debug!("Session {}: detach ignored: {}", session_id, e),
        }
    }

    /// Record activity in memory now and in the store in the background
    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.get(session_id).await {
            session.touch();
        }
        let store = self.store.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.touch_session(&session_id, Utc::now()).await {
                tracing::debug!("Session {}: touch failed: {}", session_id, e);
            }
        });
    }

    /// Send user input followed by Enter, record it and arm the backoff
    pub async fn input(&self, session_id: &str, content: &str) -> Result<(), SessionError> {
        let (session, handle) = self.require_process(session_id).await?;

        handle
            .write_line(content)
            .await
            .map_err(|e| SessionError::Process(e.to_string()))?;

        session.push_message(ChatMessage::user(content)).await;
        if let Err(e) = self.store.append_message(session_id, "user", content).await {
            tracing::warn!("Session {}: failed to store message: {}", session_id, e);
        }

        self.scheduler.schedule(session);
        Ok(())
    }

    /// Interrupt the CLI
    pub async fn abort(&self, session_id: &str) -> Result<(), SessionError> {
        let (session, handle) = self.require_process(session_id).await?;
        handle
            .write(b"\x03")
            .await
            .map_err(|e| SessionError::Process(e.to_string()))?;
        self.scheduler.cancel(session_id);
        session
            .update_classification(Classification {
                state: CliState::Idle,
                tool: None,
            })
            .await;
        tracing::info!("Session {}: aborted", session_id);
        Ok(())
    }

    pub async fn send_enter(&self, session_id: &str) -> Result<(), SessionError> {
        self.send_raw(session_id, b"\r").await
    }

    pub async fn send_raw(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let (_, handle) = self.require_process(session_id).await?;
        handle
            .write(data)
            .await
            .map_err(|e| SessionError::Process(e.to_string()))
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::Process(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }
        let (_, handle) = self.require_process(session_id).await?;
        handle
            .resize(cols, rows)
            .await
            .map_err(|e| SessionError::Process(e.to_string()))
    }

    /// Kill a session: process, multiplexer session, timers, registry entry.
    ///
    /// A session that only exists in the store (e.g. a tmux session left
    /// over from a previous server run) is killed through the multiplexer.
    pub async fn kill(&self, session_id: &str) -> Result<(), SessionError> {
        let Some(session) = self.get(session_id).await else {
            let stored = self.store.get_session(session_id).await?;
            if stored.is_none() && !self.supervisor.multiplexer_exists(session_id).await {
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            self.scheduler.cancel(session_id);
            self.supervisor.kill_multiplexer(session_id).await;
            self.store.mark_inactive(session_id).await?;
            tracing::info!("Session {} killed (not loaded)", session_id);
            return Ok(());
        };

        let _lifecycle = session.lifecycle_lock().lock().await;
        self.apply_transition(&session, PhaseEvent::Killed).await?;
        tracing::info!("Session {} killed", session_id);
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<StatusReport, SessionError> {
        let session = self.require(session_id).await?;
        Ok(session
            .status(self.scheduler.outstanding(session_id), None)
            .await)
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError> {
        Ok(self.require(session_id).await?.messages().await)
    }

    /// Current buffer, or the stored snapshot for sessions not loaded
    pub async fn buffered_output(&self, session_id: &str) -> Result<String, SessionError> {
        if let Some(session) = self.get(session_id).await {
            return Ok(session.buffer_snapshot().await);
        }
        self.store
            .load_output(session_id)
            .await?
            .map(|o| o.output)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Flush the buffer now, dirty or not
    pub async fn save(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.require(session_id).await?;
        self.flush_session(&session, true).await
    }

    /// Sessions that are up, most recently active first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.phase().await.is_running() {
                summaries.push(session.summary().await);
            }
        }
        summaries.sort_by_key(|s| s.idle_seconds);
        summaries
    }

    /// Active sessions known to the store, loaded or not
    pub async fn stored_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.store.list_sessions(true).await?)
    }

    pub async fn multiplexer_exists(&self, session_id: &str) -> bool {
        self.supervisor.multiplexer_exists(session_id).await
    }

    pub fn has_multiplexer(&self) -> bool {
        self.supervisor.has_multiplexer()
    }

    pub fn multiplexer_name(&self, session_id: &str) -> String {
        self.supervisor.multiplexer_name(session_id)
    }

    async fn flush_session(&self, session: &Session, force: bool) -> Result<(), SessionError> {
        let Some(snapshot) = session.take_dirty_snapshot(force).await else {
            return Ok(());
        };
        match self.store.save_output(&session.id, &snapshot).await {
            Ok(()) => {
                tracing::trace!(
                    "Session {}: flushed {} chars",
                    session.id,
                    snapshot.chars().count()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Session {}: flush failed, will retry: {}", session.id, e);
                session.mark_dirty();
                Err(e.into())
            }
        }
    }

    /// Flush every dirty session; returns how many were written
    pub async fn flush_dirty(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut flushed = 0;
        for session in sessions {
            if !session.is_dirty() {
                continue;
            }
            if self.flush_session(&session, false).await.is_ok() {
                flushed += 1;
            }
        }
        if flushed > 0 {
            tracing::debug!("Flushed {} dirty sessions", flushed);
        }
        flushed
    }

    /// Kill sessions without activity for longer than `timeout`, attached or not
    pub async fn sweep_idle(&self, timeout: Duration, hard_delete: bool) -> Vec<String> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut swept = Vec::new();
        for session in sessions {
            if session.idle_for() <= timeout {
                continue;
            }
            let _lifecycle = session.lifecycle_lock().lock().await;
            // Re-check under the lock, a reconnect may have touched it meanwhile
            if session.idle_for() <= timeout || !session.phase().await.is_running() {
                continue;
            }
            if self
                .apply_transition(&session, PhaseEvent::IdleTimeout)
                .await
                .is_err()
            {
                continue;
            }
            tracing::info!(
                "Session {} idle for {}s, killed",
                session.id,
                session.idle_for().as_secs()
            );
            if hard_delete {
                if let Err(e) = self.store.delete_session(&session.id).await {
                    tracing::warn!("Session {}: failed to delete: {}", session.id, e);
                }
            }
            swept.push(session.id.clone());
        }
        swept
    }

    /// Warn attached clients whose CLI has been "responding" without output
    /// for longer than `threshold`. Never intervenes.
    pub async fn detect_stuck(&self, threshold: Duration) -> Vec<String> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut stuck = Vec::new();
        for session in sessions {
            let report = session
                .status(self.scheduler.outstanding(&session.id), Some(threshold))
                .await;
            if !report.stuck {
                continue;
            }
            tracing::info!(
                "Session {} possibly stuck, no output for {}s",
                session.id,
                report.idle_seconds
            );
            session.notify(ServerEvent::Status(report));
            stuck.push(session.id.clone());
        }
        stuck
    }

    /// Flush everything and let go of all sessions. Direct processes are
    /// killed; multiplexer sessions keep running for the next server start.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down all sessions...");
        self.scheduler.cancel_all();

        let sessions: Vec<Arc<Session>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            let _lifecycle = session.lifecycle_lock().lock().await;
            let _ = self.flush_session(session, true).await;
            session.unbind_client();

            let via_multiplexer = session.via_multiplexer();
            if let Some(handle) = session.take_process().await {
                if via_multiplexer {
                    tracing::debug!("Session {}: leaving tmux session running", session.id);
                } else {
                    handle.kill().await;
                    if let Err(e) = self.store.mark_inactive(&session.id).await {
                        tracing::warn!("Session {}: failed to mark inactive: {}", session.id, e);
                    }
                }
            }
            session.set_phase(SessionPhase::Dead).await;
        }

        tracing::info!("All sessions shut down ({})", sessions.len());
    }

    /// Called by the pump once the process output reached EOF
    async fn on_process_exit(&self, session: &Arc<Session>, epoch: u64) {
        let _lifecycle = session.lifecycle_lock().lock().await;
        if session.process_epoch() != epoch || session.phase().await == SessionPhase::Dead {
            return;
        }
        let retained =
            session.via_multiplexer() && self.supervisor.multiplexer_exists(&session.id).await;
        tracing::info!(
            "Session {}: process exited (multiplexer retained={})",
            session.id,
            retained
        );
        if let Err(e) = self
            .apply_transition(session, PhaseEvent::ProcessExited { retained })
            .await
        {
            tracing::debug!("Session {}: exit ignored: {}", session.id, e);
        }
    }
}

fn default_project_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Single consumer of a process's output: keeps delivery in arrival order
async fn run_pump(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    epoch: u64,
    mut output: mpsc::Receiver<Bytes>,
) {
    let mut parser = StreamParser::new();
    while let Some(chunk) = output.recv().await {
        let Some(changed) = session.ingest(&chunk, &mut parser).await else {
            continue;
        };
        if !changed.state.wants_enter() {
            registry.scheduler.cancel(&session.id);
        } else if changed.state == CliState::WaitingConfirm
            && !registry.scheduler.is_armed(&session.id)
        {
            // Paste prompt showed up after the input echo ended the campaign
            registry.scheduler.schedule(session.clone());
        }
    }
    tracing::debug!("Session {}: output pump finished", session.id);
    registry.on_process_exit(&session, epoch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::SpawnOutcome;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    struct FakeProcess {
        writes: StdMutex<Vec<u8>>,
        output_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
        output_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
        alive: AtomicBool,
        /// Output produced whenever a bare Enter is written
        on_enter: StdMutex<Option<String>>,
    }

    impl FakeProcess {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(64);
            Arc::new(Self {
                writes: StdMutex::new(Vec::new()),
                output_tx: StdMutex::new(Some(tx)),
                output_rx: StdMutex::new(Some(rx)),
                alive: AtomicBool::new(true),
                on_enter: StdMutex::new(None),
            })
        }

        async fn emit(&self, text: &str) {
            let tx = self.output_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(Bytes::from(text.to_string())).await.unwrap();
            }
        }

        fn exit(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.output_tx.lock().unwrap().take();
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.writes.lock().unwrap()).to_string()
        }

        fn enter_count(&self) -> usize {
            self.written().matches('\r').count()
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
            if !self.alive.load(Ordering::SeqCst) {
                anyhow::bail!("process exited");
            }
            self.writes.lock().unwrap().extend_from_slice(data);
            if data == b"\r" {
                let reply = self.on_enter.lock().unwrap().clone();
                if let Some(reply) = reply {
                    self.emit(&reply).await;
                }
            }
            Ok(())
        }

        async fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn kill(&self) {
            self.exit();
        }

        fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
            self.output_rx.lock().unwrap().take()
        }
    }

    #[derive(Default)]
    struct FakeSupervisor {
        with_multiplexer: bool,
        fail: AtomicBool,
        spawned: AtomicUsize,
        processes: StdMutex<Vec<Arc<FakeProcess>>>,
        multiplexer_sessions: StdMutex<HashSet<String>>,
    }

    impl FakeSupervisor {
        fn last(&self) -> Arc<FakeProcess> {
            self.processes.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn spawn_or_attach(
            &self,
            session_id: &str,
            _project_path: &Path,
        ) -> anyhow::Result<SpawnOutcome> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no pty available");
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let process = FakeProcess::new();
            self.processes.lock().unwrap().push(process.clone());

            let attached_existing = self.with_multiplexer
                && !self
                    .multiplexer_sessions
                    .lock()
                    .unwrap()
                    .insert(session_id.to_string());
            Ok(SpawnOutcome {
                handle: process,
                attached_existing,
                via_multiplexer: self.with_multiplexer,
            })
        }

        fn multiplexer_name(&self, session_id: &str) -> String {
            format!("ptyhub-{}", session_id)
        }

        fn has_multiplexer(&self) -> bool {
            self.with_multiplexer
        }

        async fn multiplexer_exists(&self, session_id: &str) -> bool {
            self.multiplexer_sessions.lock().unwrap().contains(session_id)
        }

        async fn kill_multiplexer(&self, session_id: &str) {
            self.multiplexer_sessions.lock().unwrap().remove(session_id);
        }
    }

    fn registry_with(
        supervisor: Arc<FakeSupervisor>,
        store: Arc<MemoryStore>,
    ) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            SessionConfig::default(),
            supervisor,
            store,
            Scheduler::new(vec![
                Duration::from_secs(3),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ]),
        ))
    }

    fn request(id: &str) -> ConnectRequest {
        ConnectRequest {
            session_id: Some(id.to_string()),
            project_path: Some(PathBuf::from("/tmp")),
            start_cli: false,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    /// Drain events until one matches
    async fn wait_for_event<F>(events: &mut mpsc::UnboundedReceiver<ServerEvent>, f: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        loop {
            let event = next_event(events).await;
            if f(&event) {
                return event;
            }
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_new_session() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());

        let mut conn = registry.connect(request("s1")).await.unwrap();
        assert!(!conn.reconnected);
        assert_eq!(
            next_event(&mut conn.events).await,
            ServerEvent::Connected {
                session_id: "s1".to_string(),
                reconnected: false,
                project_path: "/tmp".to_string(),
            }
        );

        let status = registry.status("s1").await.unwrap();
        assert_eq!(status.phase, SessionPhase::Live);
        assert!(status.client_attached);
        assert!(store.get_session("s1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_connect_without_id_generates_one() {
        let registry = registry_with(
            Arc::new(FakeSupervisor::default()),
            Arc::new(MemoryStore::new(1024)),
        );
        let conn = registry.connect(ConnectRequest::default()).await.unwrap();
        assert!(!conn.session_id.is_empty());
        assert!(registry.get(&conn.session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_start_cli_only_on_brand_new_session() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));

        let mut req = request("s1");
        req.start_cli = true;
        let conn = registry.connect(req.clone()).await.unwrap();
        assert_eq!(supervisor.last().written(), "claude\r");

        registry.detach("s1", conn.client_id).await;
        registry.connect(req).await.unwrap();
        assert_eq!(supervisor.last().written(), "claude\r");
        assert_eq!(supervisor.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replays_buffer_without_respawn() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));

        let mut first = registry.connect(request("s1")).await.unwrap();
        supervisor.last().emit("$ make\nbuilding...\n").await;
        wait_for_event(&mut first.events, |e| matches!(e, ServerEvent::Output { .. })).await;

        registry.detach("s1", first.client_id).await;
        assert_eq!(
            registry.status("s1").await.unwrap().phase,
            SessionPhase::Detached
        );

        let mut second = registry.connect(request("s1")).await.unwrap();
        assert!(second.reconnected);
        assert_eq!(supervisor.spawned.load(Ordering::SeqCst), 1);
        assert!(matches!(
            next_event(&mut second.events).await,
            ServerEvent::Connected {
                reconnected: true,
                ..
            }
        ));
        assert_eq!(
            next_event(&mut second.events).await,
            ServerEvent::OutputBuffer {
                data: "$ make\nbuilding...\n".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_page_reload_replaces_client() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));

        let first = registry.connect(request("s1")).await.unwrap();
        let mut second = registry.connect(request("s1")).await.unwrap();

        // The old socket closing late must not detach the new one
        registry.detach("s1", first.client_id).await;
        let status = registry.status("s1").await.unwrap();
        assert_eq!(status.phase, SessionPhase::Live);
        assert!(status.client_attached);

        supervisor.last().emit("hello").await;
        wait_for_event(&mut second.events, |e| {
            matches!(e, ServerEvent::Output { data } if data == "hello")
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_registered() {
        let supervisor = Arc::new(FakeSupervisor::default());
        supervisor.fail.store(true, Ordering::SeqCst);
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));

        let result = registry.connect(request("s1")).await;
        assert!(matches!(result, Err(SessionError::Spawn(_))));
        assert!(registry.get("s1").await.is_none());
        assert!(matches!(
            registry.status("s1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_input_records_message_and_arms_backoff() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        registry.connect(request("s1")).await.unwrap();

        registry.input("s1", "build the project").await.unwrap();

        assert_eq!(supervisor.last().written(), "build the project\r");
        let history = registry.history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].content, "build the project");

        let stored = store.load_messages("s1", None).await.unwrap();
        assert_eq!(stored[0].role, "user");
        // Nothing printed yet, the CLI may be sitting on a paste prompt
        assert_eq!(registry.status("s1").await.unwrap().state, CliState::Unknown);
        assert_eq!(registry.scheduler().outstanding("s1"), 4);
    }

    #[tokio::test]
    async fn test_ready_prompt_cancels_backoff() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();

        registry.input("s1", "hello").await.unwrap();
        assert!(registry.scheduler().is_armed("s1"));

        supervisor.last().emit("done\n> \n").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::Idle,
                    ..
                }
            )
        })
        .await;
        assert_eq!(registry.scheduler().outstanding("s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paste_prompt_after_idle_rearms_backoff() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();
        let process = supervisor.last();

        registry.input("s1", "line one\nline two").await.unwrap();
        let enters_after_input = process.enter_count();

        // Input echo on the ready prompt ends the first campaign
        process.emit("> \n").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::Idle,
                    ..
                }
            )
        })
        .await;
        assert!(!registry.scheduler().is_armed("s1"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        process.emit("> [Pasted text #1 +2 lines]").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::WaitingConfirm,
                    ..
                }
            )
        })
        .await;
        assert_eq!(registry.scheduler().outstanding("s1"), 4);

        *process.on_enter.lock().unwrap() = Some(format!("{}✻ Pondering…", "\n".repeat(600)));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        settle().await;
        assert_eq!(process.enter_count(), enters_after_input + 1);
        assert_eq!(registry.scheduler().outstanding("s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paste_marker_gets_exactly_one_enter_at_three_seconds() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();
        let process = supervisor.last();

        registry.input("s1", "line one\nline two").await.unwrap();
        let enters_after_input = process.enter_count();

        process.emit("> [Pasted text #1 +2 lines]").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::WaitingConfirm,
                    ..
                }
            )
        })
        .await;

        // The CLI redraws and starts working once the Enter lands
        *process.on_enter.lock().unwrap() = Some(format!("{}✻ Pondering…", "\n".repeat(600)));

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(process.enter_count(), enters_after_input);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(process.enter_count(), enters_after_input + 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(process.enter_count(), enters_after_input + 1);
        assert_eq!(registry.scheduler().outstanding("s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_before_fire_sends_no_enter() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();
        let process = supervisor.last();

        registry.input("s1", "hello").await.unwrap();
        let enters_after_input = process.enter_count();

        process.emit("⏺ Read(src/main.rs)").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::ToolRunning,
                    ..
                }
            )
        })
        .await;
        assert_eq!(registry.scheduler().outstanding("s1"), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(process.enter_count(), enters_after_input);
    }

    #[tokio::test]
    async fn test_abort_interrupts_and_forces_idle() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();
        let process = supervisor.last();

        registry.input("s1", "go").await.unwrap();
        process.emit("⏺ Here is my answer").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::Responding,
                    ..
                }
            )
        })
        .await;

        registry.abort("s1").await.unwrap();
        assert!(process.written().ends_with('\x03'));
        assert_eq!(registry.scheduler().outstanding("s1"), 0);
        assert_eq!(registry.status("s1").await.unwrap().state, CliState::Idle);
    }

    #[tokio::test]
    async fn test_kill_cancels_timers_and_removes() {
        let supervisor = Arc::new(FakeSupervisor {
            with_multiplexer: true,
            ..FakeSupervisor::default()
        });
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let mut conn = registry.connect(request("s1")).await.unwrap();
        registry.input("s1", "hello").await.unwrap();
        assert!(registry.scheduler().is_armed("s1"));

        registry.kill("s1").await.unwrap();

        assert_eq!(registry.scheduler().outstanding("s1"), 0);
        assert!(!supervisor.last().is_alive().await);
        assert!(!registry.multiplexer_exists("s1").await);
        assert!(matches!(
            registry.status("s1").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);

        // Client channel is closed once the session is gone
        while conn.events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_kill_unknown_session() {
        let registry = registry_with(
            Arc::new(FakeSupervisor::default()),
            Arc::new(MemoryStore::new(1024)),
        );
        assert!(matches!(
            registry.kill("nope").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_process_exit_without_multiplexer_is_dead() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();

        supervisor.last().exit();
        let event = wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert_eq!(event, ServerEvent::error("Process exited"));

        for _ in 0..50 {
            if registry.get("s1").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_process_exit_with_multiplexer_reattaches() {
        let supervisor = Arc::new(FakeSupervisor {
            with_multiplexer: true,
            ..FakeSupervisor::default()
        });
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();

        supervisor.last().exit();
        wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Error { .. })).await;
        // Socket side is closed so the client reconnects
        while conn.events.recv().await.is_some() {}
        assert_eq!(
            registry.status("s1").await.unwrap().phase,
            SessionPhase::Detached
        );

        let conn = registry.connect(request("s1")).await.unwrap();
        assert!(conn.reconnected);
        assert_eq!(supervisor.spawned.load(Ordering::SeqCst), 2);
        assert!(registry.status("s1").await.unwrap().process_alive);
    }

    #[tokio::test]
    async fn test_restore_from_store_before_traffic() {
        let supervisor = Arc::new(FakeSupervisor {
            with_multiplexer: true,
            ..FakeSupervisor::default()
        });
        let store = Arc::new(MemoryStore::new(1024));
        store
            .upsert_session(&SessionRecord::new("s1", "/work", "ptyhub-s1"))
            .await
            .unwrap();
        store.save_output("s1", "previous output").await.unwrap();
        store.append_message("s1", "user", "earlier").await.unwrap();
        supervisor
            .multiplexer_sessions
            .lock()
            .unwrap()
            .insert("s1".to_string());

        let registry = registry_with(supervisor.clone(), store);
        let mut req = request("s1");
        req.project_path = None;
        req.start_cli = true;
        let mut conn = registry.connect(req).await.unwrap();

        assert!(conn.reconnected);
        // Attached to the surviving tmux session, CLI not typed again
        assert_eq!(supervisor.last().written(), "");
        assert!(matches!(
            next_event(&mut conn.events).await,
            ServerEvent::Connected { project_path, .. } if project_path == "/work"
        ));
        assert_eq!(
            next_event(&mut conn.events).await,
            ServerEvent::OutputBuffer {
                data: "previous output".to_string()
            }
        );
        assert_eq!(registry.history("s1").await.unwrap()[0].content, "earlier");
    }

    #[tokio::test]
    async fn test_detach_flushes_buffer() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let mut conn = registry.connect(request("s1")).await.unwrap();

        supervisor.last().emit("some output").await;
        wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Output { .. })).await;
        registry.detach("s1", conn.client_id).await;

        assert_eq!(
            store.load_output("s1").await.unwrap().unwrap().output,
            "some output"
        );
        assert_eq!(registry.flush_dirty().await, 0);
    }

    #[tokio::test]
    async fn test_flush_dirty_skips_clean_sessions() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let mut a = registry.connect(request("a")).await.unwrap();
        registry.connect(request("b")).await.unwrap();

        let first = supervisor.processes.lock().unwrap()[0].clone();
        first.emit("from a").await;
        wait_for_event(&mut a.events, |e| matches!(e, ServerEvent::Output { .. })).await;

        assert_eq!(registry.flush_dirty().await, 1);
        assert_eq!(registry.flush_dirty().await, 0);
        assert!(store.load_output("b").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_skips_recently_active() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let idle = registry.connect(request("idle")).await.unwrap();
        registry.connect(request("busy")).await.unwrap();
        registry.detach("idle", idle.client_id).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        registry.touch("busy").await;
        let swept = registry.sweep_idle(Duration::from_secs(60), false).await;

        assert_eq!(swept, vec!["idle".to_string()]);
        assert!(registry.get("idle").await.is_none());
        assert!(registry.get("busy").await.is_some());
        // Marked inactive, not deleted
        assert!(!store.get_session("idle").await.unwrap().unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_kills_attached_session() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let mut conn = registry.connect(request("s1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        let swept = registry.sweep_idle(Duration::from_secs(60), false).await;

        assert_eq!(swept, vec!["s1".to_string()]);
        assert!(registry.get("s1").await.is_none());
        assert!(!supervisor.last().is_alive().await);
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);

        let event = wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert_eq!(event, ServerEvent::error("Session closed after inactivity"));
        while conn.events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_kill_over_dispatch_stays_inactive() {
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(Arc::new(FakeSupervisor::default()), store.clone());
        registry.connect(request("s1")).await.unwrap();
        crate::protocol::dispatch(&registry, "s1", crate::protocol::ClientMessage::Ping)
            .await
            .unwrap();

        crate::protocol::dispatch(&registry, "s1", crate::protocol::ClientMessage::KillSession)
            .await
            .unwrap();
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);

        // Any touch still in flight must not bring it back
        settle().await;
        registry.touch("s1").await;
        settle().await;
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);
        assert!(store.list_sessions(true).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_hard_delete() {
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(Arc::new(FakeSupervisor::default()), store.clone());
        let conn = registry.connect(request("s1")).await.unwrap();
        registry.detach("s1", conn.client_id).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        registry.sweep_idle(Duration::from_secs(60), true).await;
        assert!(store.get_session("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_stuck_responding_session() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let registry = registry_with(supervisor.clone(), Arc::new(MemoryStore::new(1024)));
        let mut conn = registry.connect(request("s1")).await.unwrap();

        supervisor.last().emit("⏺ Let me explain").await;
        wait_for_event(&mut conn.events, |e| {
            matches!(
                e,
                ServerEvent::StateChange {
                    state: CliState::Responding,
                    ..
                }
            )
        })
        .await;

        assert!(registry.detect_stuck(Duration::from_secs(120)).await.is_empty());
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(
            registry.detect_stuck(Duration::from_secs(120)).await,
            vec!["s1".to_string()]
        );
        let event = wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Status(_))).await;
        match event {
            ServerEvent::Status(report) => {
                assert!(report.stuck);
                assert!(report.idle_seconds >= 120);
            }
            _ => unreachable!(),
        }
        // No intervention
        assert!(registry.status("s1").await.unwrap().process_alive);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_multiplexer_sessions() {
        let supervisor = Arc::new(FakeSupervisor {
            with_multiplexer: true,
            ..FakeSupervisor::default()
        });
        let store = Arc::new(MemoryStore::new(1024));
        let registry = registry_with(supervisor.clone(), store.clone());
        let mut conn = registry.connect(request("s1")).await.unwrap();
        supervisor.last().emit("work in progress").await;
        wait_for_event(&mut conn.events, |e| matches!(e, ServerEvent::Output { .. })).await;

        registry.shutdown().await;

        assert!(registry.list().await.is_empty());
        assert!(supervisor.multiplexer_exists("s1").await);
        assert!(store.get_session("s1").await.unwrap().unwrap().is_active);
        assert_eq!(
            store.load_output("s1").await.unwrap().unwrap().output,
            "work in progress"
        );
    }

    #[tokio::test]
    async fn test_buffered_output_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new(1024));
        store.save_output("old", "stored").await.unwrap();
        let registry = registry_with(Arc::new(FakeSupervisor::default()), store);

        assert_eq!(registry.buffered_output("old").await.unwrap(), "stored");
        assert!(matches!(
            registry.buffered_output("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }
}
