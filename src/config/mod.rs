//! Configuration module for ptyhub

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub multiplexer: MultiplexerConfig,
    pub backoff: BackoffConfig,
    pub sweeper: SweeperConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of characters kept in memory and in the store per session
    pub max_buffer: usize,
    /// Number of trailing characters handed to the state classifier
    pub tail_window: usize,
    /// Command typed into a freshly created session when the client asks for it
    pub cli_command: String,
    /// Shell used when no multiplexer is available; `None` means `$SHELL`
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffer: 100 * 1024,
            tail_window: 500,
            cli_command: "claude".to_string(),
            shell: None,
            cols: 120,
            rows: 40,
        }
    }
}

impl SessionConfig {
    pub fn with_cli_command(mut self, command: String) -> Self {
        if !command.trim().is_empty() {
            self.cli_command = command;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub enabled: bool,
    pub candidate_paths: Vec<PathBuf>,
    pub name_prefix: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidate_paths: vec![
                PathBuf::from("/opt/homebrew/bin/tmux"),
                PathBuf::from("/usr/local/bin/tmux"),
                PathBuf::from("/usr/bin/tmux"),
                PathBuf::from("/bin/tmux"),
            ],
            name_prefix: "ptyhub-".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delays measured from the moment the campaign is armed, ascending
    pub delays_ms: Vec<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delays_ms: vec![3_000, 5_000, 10_000, 20_000],
        }
    }
}

impl BackoffConfig {
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays: Vec<Duration> = self
            .delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        delays.sort();
        delays
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub idle_timeout: u64,
    pub idle_interval: u64,
    pub flush_interval: u64,
    pub stuck_threshold: u64,
    pub stuck_interval: u64,
    pub hard_delete_idle: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 24 * 60 * 60,
            idle_interval: 60,
            flush_interval: 30,
            stuck_threshold: 120,
            stuck_interval: 15,
            hard_delete_idle: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite database path; `None` keeps everything in memory
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("ptyhub.db")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.host, "127.0.0.1");

        assert_eq!(config.session.tail_window, 500);
        assert_eq!(config.session.cli_command, "claude");
        assert!(config.multiplexer.enabled);
        assert_eq!(config.multiplexer.candidate_paths.len(), 4);
        assert_eq!(config.sweeper.stuck_threshold, 120);
        assert!(!config.sweeper.hard_delete_idle);
    }

    #[test]
    fn test_backoff_delays_sorted() {
        let backoff = BackoffConfig {
            delays_ms: vec![10_000, 3_000, 20_000, 5_000],
        };
        assert_eq!(
            backoff.delays(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ]
        );
    }

    #[test]
    fn test_default_backoff_matches_campaign() {
        let delays = BackoffConfig::default().delays();
        assert_eq!(delays.first(), Some(&Duration::from_secs(3)));
        assert_eq!(delays.last(), Some(&Duration::from_secs(20)));
    }

    #[test]
    fn test_with_cli_command() {
        let session = SessionConfig::default().with_cli_command("my-claude".to_string());
        assert_eq!(session.cli_command, "my-claude");
    }

    #[test]
    fn test_with_cli_command_whitespace_ignored() {
        let session = SessionConfig::default().with_cli_command("   ".to_string());
        assert_eq!(session.cli_command, "claude");
    }

    #[test]
    fn test_storage_default_is_on_disk() {
        let storage = StorageConfig::default();
        assert_eq!(storage.db_path, Some(PathBuf::from("ptyhub.db")));
    }
}
