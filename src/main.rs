//! ptyhub - keeps AI CLI sessions alive in tmux and serves them over WebSocket

use clap::{Parser, Subcommand};
use ptyhub::{
    config::{
        BackoffConfig, Config, MultiplexerConfig, ServerConfig, SessionConfig, StorageConfig,
        SweeperConfig,
    },
    pty::PtySupervisor,
    scheduler::Scheduler,
    session::SessionRegistry,
    store::{MemoryStore, SessionStore, SqliteStore},
    sweeper::Sweepers,
    web::{WebServer, WebServerRunOptions},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ptyhub")]
#[command(version)]
#[command(about = "Keeps AI CLI sessions alive in tmux and bridges them to web clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Web server port [env: PTYHUB_PORT]
    #[arg(short, long, default_value = "8765", env = "PTYHUB_PORT")]
    port: u16,

    /// Web server host [env: PTYHUB_HOST]
    #[arg(long, default_value = "127.0.0.1", env = "PTYHUB_HOST")]
    host: String,

    /// Retry binding to successive ports if the port is in use [env: PTYHUB_PORT_RETRY]
    #[arg(long, default_value = "0", env = "PTYHUB_PORT_RETRY")]
    port_retry: u16,

    /// SQLite database path [env: PTYHUB_DB]
    #[arg(long, default_value = "ptyhub.db", env = "PTYHUB_DB")]
    db: PathBuf,

    /// Keep session data in memory only [env: PTYHUB_NO_PERSIST]
    #[arg(long, env = "PTYHUB_NO_PERSIST")]
    no_persist: bool,

    /// Output buffer cap per session, in characters [env: PTYHUB_BUFFER_SIZE]
    #[arg(long, default_value = "102400", env = "PTYHUB_BUFFER_SIZE")]
    buffer_size: usize,

    /// Trailing characters used for state detection [env: PTYHUB_TAIL_WINDOW]
    #[arg(long, default_value = "500", env = "PTYHUB_TAIL_WINDOW")]
    tail_window: usize,

    /// Command typed into new sessions when the client asks to start the CLI [env: PTYHUB_CLI_CMD]
    #[arg(long, default_value = "claude", env = "PTYHUB_CLI_CMD")]
    cli_cmd: String,

    /// Shell for sessions [env: PTYHUB_SHELL]
    #[arg(long, env = "PTYHUB_SHELL")]
    shell: Option<String>,

    /// tmux binary candidates, comma-separated [env: PTYHUB_TMUX_PATHS]
    #[arg(long, value_delimiter = ',', env = "PTYHUB_TMUX_PATHS")]
    tmux_paths: Vec<PathBuf>,

    /// Spawn processes directly instead of through tmux [env: PTYHUB_NO_TMUX]
    #[arg(long, env = "PTYHUB_NO_TMUX")]
    no_tmux: bool,

    /// Enter backoff delays in milliseconds, comma-separated [env: PTYHUB_BACKOFF_MS]
    #[arg(long, value_delimiter = ',', default_value = "3000,5000,10000,20000", env = "PTYHUB_BACKOFF_MS")]
    backoff_ms: Vec<u64>,

    /// Seconds without activity before a session is killed [env: PTYHUB_IDLE_TIMEOUT]
    #[arg(long, default_value = "86400", env = "PTYHUB_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// Delete idle sessions from the store instead of marking them inactive [env: PTYHUB_HARD_DELETE_IDLE]
    #[arg(long, env = "PTYHUB_HARD_DELETE_IDLE")]
    hard_delete_idle: bool,

    /// Seconds of silence while responding before a session is reported stuck [env: PTYHUB_STUCK_THRESHOLD]
    #[arg(long, default_value = "120", env = "PTYHUB_STUCK_THRESHOLD")]
    stuck_threshold: u64,

    /// Idle sweep interval in seconds [env: PTYHUB_IDLE_INTERVAL]
    #[arg(long, default_value = "60", env = "PTYHUB_IDLE_INTERVAL")]
    idle_interval: u64,

    /// Output flush interval in seconds [env: PTYHUB_FLUSH_INTERVAL]
    #[arg(long, default_value = "30", env = "PTYHUB_FLUSH_INTERVAL")]
    flush_interval: u64,

    /// Stuck detection interval in seconds [env: PTYHUB_STUCK_INTERVAL]
    #[arg(long, default_value = "15", env = "PTYHUB_STUCK_INTERVAL")]
    stuck_interval: u64,

    /// Log file path (optional, if not set logs only go to stderr) [env: PTYHUB_LOG_FILE]
    #[arg(long, env = "PTYHUB_LOG_FILE")]
    log_file: Option<String>,

    /// Log directory for rotating logs [env: PTYHUB_LOG_DIR]
    #[arg(long, env = "PTYHUB_LOG_DIR")]
    log_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_tracing(&cli)?;

    let config = Arc::new(build_config(&cli));

    match cli.command {
        Some(Commands::Serve) | None => run_server(config, cli.port_retry).await?,
        Some(Commands::Config) => show_config(&config),
    }

    Ok(())
}

fn init_tracing(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ptyhub=debug,tower_http=debug".into());

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if let Some(log_dir) = &cli.log_dir {
        // Rotating file appender (daily rotation)
        let file_appender = tracing_appender::rolling::daily(log_dir, "ptyhub.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        return Ok(Some(guard));
    }

    if let Some(log_file) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", log_file, e))?;

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(Arc::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }

    Ok(None)
}

fn build_config(cli: &Cli) -> Config {
    let mut multiplexer = MultiplexerConfig {
        enabled: !cli.no_tmux,
        ..MultiplexerConfig::default()
    };
    if !cli.tmux_paths.is_empty() {
        multiplexer.candidate_paths = cli.tmux_paths.clone();
    }

    Config {
        server: ServerConfig {
            port: cli.port,
            host: cli.host.clone(),
        },
        session: SessionConfig {
            max_buffer: cli.buffer_size,
            tail_window: cli.tail_window,
            shell: cli.shell.clone(),
            ..SessionConfig::default()
        }
        .with_cli_command(cli.cli_cmd.clone()),
        multiplexer,
        backoff: BackoffConfig {
            delays_ms: cli.backoff_ms.clone(),
        },
        sweeper: SweeperConfig {
            idle_timeout: cli.idle_timeout,
            idle_interval: cli.idle_interval,
            flush_interval: cli.flush_interval,
            stuck_threshold: cli.stuck_threshold,
            stuck_interval: cli.stuck_interval,
            hard_delete_idle: cli.hard_delete_idle,
        },
        storage: StorageConfig {
            db_path: (!cli.no_persist).then(|| cli.db.clone()),
        },
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    let max_output = config.session.max_buffer;
    let store: Arc<dyn SessionStore> = match &config.storage.db_path {
        Some(path) => {
            tracing::info!("Persisting sessions to {}", path.display());
            Arc::new(SqliteStore::open(path, max_output)?)
        }
        None => {
            tracing::warn!("Persistence disabled, session data is lost on restart");
            Arc::new(MemoryStore::new(max_output))
        }
    };
    Ok(store)
}

async fn run_server(config: Arc<Config>, port_retry: u16) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let supervisor = Arc::new(PtySupervisor::new(&config.session, &config.multiplexer));
    let scheduler = Scheduler::new(config.backoff.delays());
    let registry = Arc::new(SessionRegistry::new(
        config.session.clone(),
        supervisor,
        store,
        scheduler,
    ));

    let sweepers = Sweepers::start(registry.clone(), &config.sweeper);

    let web_server = WebServer::new(registry.clone(), config);
    let options = WebServerRunOptions { port_retry };
    // Attached sockets never drain, so stop serving outright on a signal
    let result = tokio::select! {
        result = web_server.run_with_options(options) => result,
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    sweepers.stop();
    registry.shutdown().await;
    tracing::info!("Cleanup complete");

    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let signals = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        match signals {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT"),
                    _ = sighup.recv() => tracing::info!("Received SIGHUP"),
                }
                return;
            }
            _ => tracing::warn!("Failed to register signal handlers, falling back to Ctrl+C"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn show_config(config: &Config) {
    println!("ptyhub Configuration");
    println!("====================");
    println!();
    println!("Server:");
    println!("  Host: {}", config.server.host);
    println!("  Port: {}", config.server.port);
    println!();
    println!("Sessions:");
    println!("  Buffer cap: {} chars", config.session.max_buffer);
    println!("  Tail window: {} chars", config.session.tail_window);
    println!("  CLI command: {}", config.session.cli_command);
    println!(
        "  Shell: {}",
        config.session.shell.as_deref().unwrap_or("$SHELL")
    );
    println!();
    println!("Multiplexer:");
    println!("  Enabled: {}", config.multiplexer.enabled);
    for path in &config.multiplexer.candidate_paths {
        println!("  - {}", path.display());
    }
    println!();
    println!("Backoff (ms): {:?}", config.backoff.delays_ms);
    println!();
    println!("Sweepers:");
    println!("  Idle timeout: {}s (every {}s)", config.sweeper.idle_timeout, config.sweeper.idle_interval);
    println!("  Flush interval: {}s", config.sweeper.flush_interval);
    println!(
        "  Stuck threshold: {}s (every {}s)",
        config.sweeper.stuck_threshold, config.sweeper.stuck_interval
    );
    println!("  Hard delete idle: {}", config.sweeper.hard_delete_idle);
    println!();
    println!("Storage:");
    match &config.storage.db_path {
        Some(path) => println!("  SQLite: {}", path.display()),
        None => println!("  In memory"),
    }
}
