//! PTY management layer
//!
//! `Supervisor` is the seam the session registry talks to: it spawns or
//! attaches the process behind a session and answers multiplexer queries.
//! `PtySupervisor` is the real implementation on top of `portable_pty` and
//! tmux; tests substitute their own.

pub mod buffer;
pub mod tmux;

pub use buffer::OutputBuffer;
pub use tmux::Tmux;

use crate::config::{MultiplexerConfig, SessionConfig};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// A running process that a session writes to and reads from.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Non-destructive liveness probe; never reads output.
    async fn is_alive(&self) -> bool;

    /// Best-effort termination. Safe to call on an already dead handle.
    async fn kill(&self);

    /// The ordered output stream. Can be taken exactly once. It ends when
    /// the process output reaches EOF.
    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// Send text followed by Enter.
    ///
    /// Multi-line text goes through bracketed paste so the TUI does not
    /// submit it line by line. A short pause before the CR gives raw-mode
    /// TUIs time to consume the text first.
    async fn write_line(&self, line: &str) -> Result<()> {
        if line.contains('\n') {
            tracing::debug!("[PTY] Using bracketed paste mode");
            self.write(b"\x1b[200~").await?;
            self.write(line.as_bytes()).await?;
            self.write(b"\x1b[201~").await?;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        } else {
            self.write(line.as_bytes()).await?;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.write(b"\r").await
    }
}

pub struct SpawnOutcome {
    pub handle: Arc<dyn ProcessHandle>,
    /// An existing multiplexer session was attached; no new command started.
    pub attached_existing: bool,
    pub via_multiplexer: bool,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn spawn_or_attach(&self, session_id: &str, project_path: &Path)
        -> Result<SpawnOutcome>;

    fn multiplexer_name(&self, session_id: &str) -> String;

    fn has_multiplexer(&self) -> bool;

    async fn multiplexer_exists(&self, session_id: &str) -> bool;

    async fn kill_multiplexer(&self, session_id: &str);
}

/// Answer terminal query sequences ourselves.
/// Nothing renders the PTY on this side, so without these replies TUIs that
/// probe the cursor position or device attributes stall until they time out.
fn handle_terminal_queries(data: &[u8], writer: &mut dyn std::io::Write) -> std::io::Result<()> {
    // Cursor Position Report
    if data.windows(4).any(|w| w == b"\x1b[6n") {
        writer.write_all(b"\x1b[1;1R")?;
        writer.flush()?;
        tracing::debug!("[PTY] Responded to CPR query with position 1;1");
    }

    // Device Status Report
    if data.windows(4).any(|w| w == b"\x1b[5n") {
        writer.write_all(b"\x1b[0n")?;
        writer.flush()?;
        tracing::debug!("[PTY] Responded to DSR query with OK status");
    }

    // Primary Device Attributes
    if data.windows(3).any(|w| w == b"\x1b[c") {
        writer.write_all(b"\x1b[?1;0c")?;
        writer.flush()?;
        tracing::debug!("[PTY] Responded to DA query as VT100");
    }

    Ok(())
}

enum PtyCommand {
    Write {
        data: Vec<u8>,
        response: oneshot::Sender<Result<()>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub struct PtyHandle {
    write_tx: mpsc::Sender<PtyCommand>,
    output_rx: std::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
    shutdown: Arc<AtomicBool>,
}

impl PtyHandle {
    pub fn spawn_command(
        command: &[String],
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Empty command");
        }

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&command[0]);
        for arg in &command[1..] {
            cmd.arg(arg);
        }

        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        // A server started from inside tmux would otherwise refuse to attach
        cmd.env_remove("TMUX");
        cmd.env("TERM", "xterm-256color");

        if working_dir.is_dir() {
            cmd.cwd(working_dir);
        }

        let child = pair.slave.spawn_command(cmd)?;
        let pid = child.process_id();
        let child: Arc<Mutex<Box<dyn Child + Send + Sync>>> = Arc::new(Mutex::new(child));

        // Get reader BEFORE moving master
        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        let writer = Arc::new(std::sync::Mutex::new(writer));
        let writer_for_queries = writer.clone();

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let (write_tx, mut write_rx) = mpsc::channel::<PtyCommand>(256);

        let master = pair.master;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_writer = shutdown.clone();
        let shutdown_reader = shutdown.clone();

        let writer_for_commands = writer.clone();
        std::thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    PtyCommand::Write { data, response } => {
                        let result = match writer_for_commands.lock() {
                            Ok(mut w) => w
                                .write_all(&data)
                                .and_then(|_| w.flush())
                                .map_err(|e| anyhow::anyhow!("{}", e)),
                            Err(_) => Err(anyhow::anyhow!("PTY writer poisoned")),
                        };
                        let _ = response.send(result);
                    }
                    PtyCommand::Resize {
                        cols,
                        rows,
                        response,
                    } => {
                        let result = master
                            .resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            })
                            .map_err(|e| anyhow::anyhow!("{}", e));
                        let _ = response.send(result);
                    }
                    PtyCommand::Shutdown => {
                        shutdown_writer.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if shutdown_reader.load(Ordering::SeqCst) {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = &buf[..n];

                        // Must happen before forwarding, the TUI is blocked on the reply
                        if let Ok(mut w) = writer_for_queries.lock() {
                            let _ = handle_terminal_queries(data, &mut *w);
                        }

                        if output_tx.blocking_send(Bytes::copy_from_slice(data)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            tracing::debug!("[PTY] Output reader finished");
        });

        Ok(Self {
            write_tx,
            output_rx: std::sync::Mutex::new(Some(output_rx)),
            child,
            pid,
            shutdown,
        })
    }

    /// Check if child process is still running
    pub async fn try_wait(&self) -> Result<Option<portable_pty::ExitStatus>> {
        let mut child = self.child.lock().await;
        child.try_wait().map_err(|e| anyhow::anyhow!("{}", e))
    }
}

#[async_trait]
impl ProcessHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(PtyCommand::Write {
                data: data.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(PtyCommand::Resize {
                cols,
                rows,
                response: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }

    async fn is_alive(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.try_wait().await, Ok(None))
    }

    async fn kill(&self) {
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill() {
                tracing::debug!("[PTY] Kill on exited child: {}", e);
            }
        }
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            self.write_tx.send(PtyCommand::Shutdown),
        )
        .await;
    }

    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Can't await here; a tmux client dying only detaches it, the
        // tmux session itself survives
        if let Ok(mut child) = self.child.try_lock() {
            if let Err(e) = child.kill() {
                tracing::debug!("Failed to kill child on drop: {}", e);
            }
        }
    }
}

pub struct PtySupervisor {
    tmux: Option<Tmux>,
    name_prefix: String,
    shell: Vec<String>,
    cols: u16,
    rows: u16,
}

impl PtySupervisor {
    pub fn new(session: &SessionConfig, multiplexer: &MultiplexerConfig) -> Self {
        let tmux = Tmux::discover(multiplexer);
        match &tmux {
            Some(t) => tracing::info!("Using tmux at {}", t.binary().display()),
            None => tracing::warn!("tmux not found, sessions will not survive server restarts"),
        }
        Self {
            tmux,
            name_prefix: multiplexer.name_prefix.clone(),
            shell: vec![resolve_shell(session.shell.as_deref())],
            cols: session.cols,
            rows: session.rows,
        }
    }
}

fn resolve_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    if PathBuf::from("/bin/bash").is_file() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

#[async_trait]
impl Supervisor for PtySupervisor {
    async fn spawn_or_attach(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> Result<SpawnOutcome> {
        let Some(tmux) = &self.tmux else {
            tracing::info!(
                "Spawning {} directly for session {}",
                self.shell[0],
                session_id
            );
            let handle = PtyHandle::spawn_command(&self.shell, project_path, self.cols, self.rows)?;
            return Ok(SpawnOutcome {
                handle: Arc::new(handle),
                attached_existing: false,
                via_multiplexer: false,
            });
        };

        let name = self.multiplexer_name(session_id);
        let attached_existing = tmux.has_session(&name).await;
        if attached_existing {
            tracing::info!("Attaching to existing tmux session {}", name);
        } else {
            tmux.create_session(&name, project_path, self.cols, self.rows)
                .await?;
        }

        let command = tmux.attach_command(&name);
        let handle = PtyHandle::spawn_command(&command, project_path, self.cols, self.rows)?;
        Ok(SpawnOutcome {
            handle: Arc::new(handle),
            attached_existing,
            via_multiplexer: true,
        })
    }

    fn multiplexer_name(&self, session_id: &str) -> String {
        tmux::session_name(&self.name_prefix, session_id)
    }

    fn has_multiplexer(&self) -> bool {
        self.tmux.is_some()
    }

    async fn multiplexer_exists(&self, session_id: &str) -> bool {
        match &self.tmux {
            Some(tmux) => tmux.has_session(&self.multiplexer_name(session_id)).await,
            None => false,
        }
    }

    async fn kill_multiplexer(&self, session_id: &str) {
        if let Some(tmux) = &self.tmux {
            let name = self.multiplexer_name(session_id);
            if let Err(e) = tmux.kill_session(&name).await {
                tracing::debug!("tmux kill-session {} failed: {}", name, e);
            }
        }
    }
}
