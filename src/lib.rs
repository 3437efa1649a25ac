//! ptyhub - AI CLI session orchestration over WebSocket
//!
//! Keeps CLI processes alive in tmux, classifies their state from terminal
//! output, nudges stalled prompts with Enter, and persists buffers and
//! message history across server restarts.

pub mod config;
pub mod parser;
pub mod protocol;
pub mod pty;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod web;
