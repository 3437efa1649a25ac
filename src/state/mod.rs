//! Session state
//!
//! Two independent state variables live on every session:
//!
//! - `CliState`: what the CLI inside the terminal appears to be doing,
//!   inferred from output by the classifier. Heuristic, never authoritative.
//! - `SessionPhase`: the lifecycle of the session itself,
//!   CREATING -> LIVE <-> DETACHED -> DEAD, driven by `Lifecycle::transition`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliState {
    /// Ready prompt visible
    Idle,
    Thinking,
    Responding,
    ToolRunning,
    /// Pasted text waiting for an Enter to be submitted
    WaitingConfirm,
    #[default]
    Unknown,
}

impl fmt::Display for CliState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Thinking => write!(f, "thinking"),
            Self::Responding => write!(f, "responding"),
            Self::ToolRunning => write!(f, "tool_running"),
            Self::WaitingConfirm => write!(f, "waiting_confirm"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl CliState {
    /// States in which a corrective Enter may still be useful.
    ///
    /// `Unknown` is included because a paste prompt is not always recognised.
    /// This can mistake a genuine stall for a pending paste.
    pub fn wants_enter(&self) -> bool {
        matches!(self, Self::WaitingConfirm | Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Registered, process being spawned or attached
    #[default]
    Creating,
    /// Process running and a client attached
    Live,
    /// Process running, no client attached
    Detached,
    /// Process gone, session removed
    Dead,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Live => write!(f, "LIVE"),
            Self::Detached => write!(f, "DETACHED"),
            Self::Dead => write!(f, "DEAD"),
        }
    }
}

impl SessionPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Live | Self::Detached)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    ClientAttached,
    ClientDetached,
    SpawnFailed { reason: String },
    /// `retained` is true when the multiplexer session outlived the process
    ProcessExited { retained: bool },
    Killed,
    IdleTimeout,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientAttached => write!(f, "client_attached"),
            Self::ClientDetached => write!(f, "client_detached"),
            Self::SpawnFailed { reason } => write!(f, "spawn_failed({})", reason),
            Self::ProcessExited { retained } => write!(f, "process_exited(retained={})", retained),
            Self::Killed => write!(f, "killed"),
            Self::IdleTimeout => write!(f, "idle_timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Attach the new client, replacing any previous one
    BindClient,
    /// Send the whole output buffer to the new client once
    ReplayBuffer,
    /// Write the output buffer to the store
    FlushBuffer,
    CancelBackoff,
    KillProcess,
    /// Forget the process handle but keep the session
    DropProcess,
    /// Tell the attached client, if any
    NotifyClient(String),
    /// Close the attached client so it reconnects
    UnbindClient,
    RemoveFromRegistry,
    MarkInactive,
}

#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub new_state: SessionPhase,
    pub side_effects: Vec<SideEffect>,
}

pub struct Lifecycle;

impl Lifecycle {
    pub fn transition(
        current: SessionPhase,
        event: PhaseEvent,
    ) -> Result<TransitionResult, LifecycleError> {
        match (current, &event) {
            // CREATING -> LIVE
            (SessionPhase::Creating, PhaseEvent::ClientAttached) => Ok(TransitionResult {
                new_state: SessionPhase::Live,
                side_effects: vec![SideEffect::BindClient, SideEffect::ReplayBuffer],
            }),

            // CREATING -> DEAD, never became visible
            (SessionPhase::Creating, PhaseEvent::SpawnFailed { reason }) => {
                Ok(TransitionResult {
                    new_state: SessionPhase::Dead,
                    side_effects: vec![
                        SideEffect::NotifyClient(format!("Failed to start session: {}", reason)),
                        SideEffect::RemoveFromRegistry,
                    ],
                })
            }

            // DETACHED -> LIVE (reconnect), LIVE -> LIVE (reload before the old socket closed)
            (SessionPhase::Detached | SessionPhase::Live, PhaseEvent::ClientAttached) => {
                Ok(TransitionResult {
                    new_state: SessionPhase::Live,
                    side_effects: vec![SideEffect::BindClient, SideEffect::ReplayBuffer],
                })
            }

            // LIVE -> DETACHED
            (SessionPhase::Live, PhaseEvent::ClientDetached) => Ok(TransitionResult {
                new_state: SessionPhase::Detached,
                side_effects: vec![SideEffect::FlushBuffer],
            }),

            // Multiplexer kept the program alive, only our client process died
            (SessionPhase::Live | SessionPhase::Detached, PhaseEvent::ProcessExited { retained: true }) => {
                Ok(TransitionResult {
                    new_state: SessionPhase::Detached,
                    side_effects: vec![
                        SideEffect::CancelBackoff,
                        SideEffect::DropProcess,
                        SideEffect::FlushBuffer,
                        SideEffect::NotifyClient(
                            "Terminal client exited, the session is still running".to_string(),
                        ),
                        SideEffect::UnbindClient,
                    ],
                })
            }

            (SessionPhase::Live | SessionPhase::Detached, PhaseEvent::ProcessExited { retained: false }) => {
                Ok(TransitionResult {
                    new_state: SessionPhase::Dead,
                    side_effects: vec![
                        SideEffect::CancelBackoff,
                        SideEffect::FlushBuffer,
                        SideEffect::NotifyClient("Process exited".to_string()),
                        SideEffect::RemoveFromRegistry,
                        SideEffect::MarkInactive,
                    ],
                })
            }

            // Explicit kill is allowed while still creating, e.g. on shutdown
            (
                SessionPhase::Creating | SessionPhase::Live | SessionPhase::Detached,
                PhaseEvent::Killed,
            ) => Ok(TransitionResult {
                new_state: SessionPhase::Dead,
                side_effects: vec![
                    SideEffect::CancelBackoff,
                    SideEffect::FlushBuffer,
                    SideEffect::KillProcess,
                    SideEffect::RemoveFromRegistry,
                    SideEffect::MarkInactive,
                ],
            }),

            (SessionPhase::Live | SessionPhase::Detached, PhaseEvent::IdleTimeout) => {
                Ok(TransitionResult {
                    new_state: SessionPhase::Dead,
                    side_effects: vec![
                        SideEffect::CancelBackoff,
                        SideEffect::FlushBuffer,
                        SideEffect::NotifyClient("Session closed after inactivity".to_string()),
                        SideEffect::KillProcess,
                        SideEffect::RemoveFromRegistry,
                        SideEffect::MarkInactive,
                    ],
                })
            }

            (state, event) => Err(LifecycleError::InvalidTransition {
                from: state,
                event: event.clone(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid state transition: {from} + {event}")]
    InvalidTransition {
        from: SessionPhase,
        event: PhaseEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creating_to_live() {
        let result =
            Lifecycle::transition(SessionPhase::Creating, PhaseEvent::ClientAttached).unwrap();
        assert_eq!(result.new_state, SessionPhase::Live);
        assert!(result.side_effects.contains(&SideEffect::BindClient));
    }

    #[test]
    fn test_spawn_failure_removes_session() {
        let result = Lifecycle::transition(
            SessionPhase::Creating,
            PhaseEvent::SpawnFailed {
                reason: "no pty".to_string(),
            },
        )
        .unwrap();
        assert_eq!(result.new_state, SessionPhase::Dead);
        assert!(result.side_effects.contains(&SideEffect::RemoveFromRegistry));
        assert!(!result.side_effects.contains(&SideEffect::MarkInactive));
    }

    #[test]
    fn test_live_to_detached_flushes() {
        let result =
            Lifecycle::transition(SessionPhase::Live, PhaseEvent::ClientDetached).unwrap();
        assert_eq!(result.new_state, SessionPhase::Detached);
        assert_eq!(result.side_effects, vec![SideEffect::FlushBuffer]);
    }

    #[test]
    fn test_detached_reattach_replays() {
        let result =
            Lifecycle::transition(SessionPhase::Detached, PhaseEvent::ClientAttached).unwrap();
        assert_eq!(result.new_state, SessionPhase::Live);
        assert!(result.side_effects.contains(&SideEffect::ReplayBuffer));
    }

    #[test]
    fn test_kill_cancels_backoff_and_removes() {
        for phase in [SessionPhase::Live, SessionPhase::Detached] {
            let result = Lifecycle::transition(phase, PhaseEvent::Killed).unwrap();
            assert_eq!(result.new_state, SessionPhase::Dead);
            assert!(result.side_effects.contains(&SideEffect::CancelBackoff));
            assert!(result.side_effects.contains(&SideEffect::KillProcess));
            assert!(result.side_effects.contains(&SideEffect::RemoveFromRegistry));
        }
    }

    #[test]
    fn test_exit_with_retained_multiplexer_stays_detached() {
        let result = Lifecycle::transition(
            SessionPhase::Live,
            PhaseEvent::ProcessExited { retained: true },
        )
        .unwrap();
        assert_eq!(result.new_state, SessionPhase::Detached);
        assert!(result.side_effects.contains(&SideEffect::DropProcess));
        assert!(result.side_effects.contains(&SideEffect::UnbindClient));
        assert!(!result.side_effects.contains(&SideEffect::RemoveFromRegistry));
    }

    #[test]
    fn test_exit_without_multiplexer_is_dead() {
        let result = Lifecycle::transition(
            SessionPhase::Detached,
            PhaseEvent::ProcessExited { retained: false },
        )
        .unwrap();
        assert_eq!(result.new_state, SessionPhase::Dead);
        assert!(result.side_effects.contains(&SideEffect::RemoveFromRegistry));
    }

    #[test]
    fn test_idle_timeout_kills_running_sessions() {
        for phase in [SessionPhase::Live, SessionPhase::Detached] {
            let result = Lifecycle::transition(phase, PhaseEvent::IdleTimeout).unwrap();
            assert_eq!(result.new_state, SessionPhase::Dead);
            assert!(result.side_effects.contains(&SideEffect::KillProcess));
            assert!(result.side_effects.contains(&SideEffect::RemoveFromRegistry));
        }
        assert!(Lifecycle::transition(SessionPhase::Creating, PhaseEvent::IdleTimeout).is_err());
    }

    #[test]
    fn test_dead_is_terminal() {
        for event in [
            PhaseEvent::ClientAttached,
            PhaseEvent::ClientDetached,
            PhaseEvent::Killed,
            PhaseEvent::IdleTimeout,
        ] {
            assert!(Lifecycle::transition(SessionPhase::Dead, event).is_err());
        }
    }

    #[test]
    fn test_wants_enter() {
        assert!(CliState::WaitingConfirm.wants_enter());
        assert!(CliState::Unknown.wants_enter());
        assert!(!CliState::Idle.wants_enter());
        assert!(!CliState::ToolRunning.wants_enter());
        assert!(!CliState::Thinking.wants_enter());
    }

    #[test]
    fn test_cli_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CliState::WaitingConfirm).unwrap(),
            "\"waiting_confirm\""
        );
        assert_eq!(CliState::ToolRunning.to_string(), "tool_running");
    }
}
