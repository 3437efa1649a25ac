//! tmux integration
//!
//! Sessions run inside a detached tmux session named after the session id,
//! so the CLI keeps running when the client goes away and when this server
//! restarts. The PTY we own only runs a `tmux attach-session` client.

use crate::config::MultiplexerConfig;
use anyhow::Result;
use std::path::{Path, PathBuf};
use sha2::{Digest, Sha256};
use std::process::Stdio;
use tokio::process::Command;

const MAX_NAME_LEN: usize = 64;
/// Hex chars of the id digest appended to altered names
const DIGEST_LEN: usize = 8;

/// Deterministic tmux session name for a session id.
///
/// tmux rejects `.` and `:` in target names, so everything outside
/// `[A-Za-z0-9_-]` is mapped to `_`, and the result is length-bounded.
/// When either step changed the id, a short digest of the raw id is
/// appended so distinct ids keep distinct names.
pub fn session_name(prefix: &str, session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = format!("{}{}", prefix, sanitized);
    if sanitized == session_id && name.len() <= MAX_NAME_LEN {
        return name;
    }

    let digest = Sha256::digest(session_id.as_bytes());
    let suffix: String = digest
        .iter()
        .take(DIGEST_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    // Only ASCII is left at this point, so any byte index is a char boundary
    let mut name = name;
    name.truncate(MAX_NAME_LEN.saturating_sub(DIGEST_LEN + 1));
    format!("{}-{}", name, suffix)
}

#[derive(Debug, Clone)]
pub struct Tmux {
    binary: PathBuf,
}

impl Tmux {
    /// Find a tmux binary on the configured candidate paths.
    pub fn discover(config: &MultiplexerConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        config
            .candidate_paths
            .iter()
            .find(|p| p.is_file())
            .map(|p| Self::with_binary(p.clone()))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn target(name: &str) -> String {
        // `=` forces an exact match instead of tmux's prefix matching
        format!("={}", name)
    }

    pub async fn has_session(&self, name: &str) -> bool {
        Command::new(&self.binary)
            .args(["has-session", "-t", &Self::target(name)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["new-session", "-d", "-s", name])
            .args(["-x", &cols.to_string(), "-y", &rows.to_string()]);
        if working_dir.is_dir() {
            cmd.arg("-c").arg(working_dir);
        }
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "tmux new-session exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        tracing::info!("[TMUX] Created session {}", name);
        Ok(())
    }

    /// Command line that attaches a client to an existing session.
    pub fn attach_command(&self, name: &str) -> Vec<String> {
        vec![
            self.binary.to_string_lossy().to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            Self::target(name),
        ]
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        let status = Command::new(&self.binary)
            .args(["kill-session", "-t", &Self::target(name)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux kill-session exited with {}", status);
        }
        tracing::info!("[TMUX] Killed session {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_passthrough() {
        assert_eq!(session_name("ptyhub-", "abc-123_x"), "ptyhub-abc-123_x");
    }

    #[test]
    fn test_session_name_sanitized() {
        let name = session_name("ptyhub-", "a.b:c/d e");
        assert!(name.starts_with("ptyhub-a_b_c_d_e-"));
        assert_eq!(name.len(), "ptyhub-a_b_c_d_e-".len() + DIGEST_LEN);
        assert!(session_name("p-", "é").starts_with("p-_-"));
    }

    #[test]
    fn test_session_name_no_collisions_after_sanitizing() {
        assert_ne!(session_name("ptyhub-", "a.b"), session_name("ptyhub-", "a_b"));
        assert_ne!(session_name("ptyhub-", "a.b"), session_name("ptyhub-", "a:b"));
        assert_eq!(session_name("ptyhub-", "a_b"), "ptyhub-a_b");
    }

    #[test]
    fn test_session_name_bounded() {
        let long = "x".repeat(200);
        let name = session_name("ptyhub-", &long);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.starts_with("ptyhub-"));

        // Shared prefix beyond the bound still gives distinct names
        let other = format!("{}y", "x".repeat(199));
        let other_name = session_name("ptyhub-", &other);
        assert_eq!(other_name.len(), MAX_NAME_LEN);
        assert_ne!(name, other_name);
    }

    #[test]
    fn test_session_name_deterministic() {
        let id = "0b7e2f4c-1d7a-4c1e-9a55-3f0e7c1d2b3a";
        assert_eq!(session_name("ptyhub-", id), session_name("ptyhub-", id));
    }

    #[test]
    fn test_discover_disabled() {
        let config = MultiplexerConfig {
            enabled: false,
            ..MultiplexerConfig::default()
        };
        assert!(Tmux::discover(&config).is_none());
    }

    #[test]
    fn test_discover_no_candidates() {
        let config = MultiplexerConfig {
            enabled: true,
            candidate_paths: vec![PathBuf::from("/nonexistent/ptyhub/tmux")],
            ..MultiplexerConfig::default()
        };
        assert!(Tmux::discover(&config).is_none());
    }

    #[test]
    fn test_attach_command_uses_exact_target() {
        let tmux = Tmux::with_binary(PathBuf::from("/usr/bin/tmux"));
        assert_eq!(
            tmux.attach_command("ptyhub-s1"),
            vec!["/usr/bin/tmux", "attach-session", "-t", "=ptyhub-s1"]
        );
    }

    #[tokio::test]
    #[ignore] // Requires a tmux binary
    async fn test_tmux_session_roundtrip() {
        let Some(tmux) = Tmux::discover(&MultiplexerConfig::default()) else {
            return;
        };
        let name = session_name("ptyhub-test-", &uuid::Uuid::new_v4().to_string());
        assert!(!tmux.has_session(&name).await);
        tmux.create_session(&name, Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        assert!(tmux.has_session(&name).await);
        tmux.kill_session(&name).await.unwrap();
        assert!(!tmux.has_session(&name).await);
    }
}
