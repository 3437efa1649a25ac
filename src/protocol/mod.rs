//! WebSocket message contract
//!
//! Every frame is a JSON object with a `type` field. Client messages are
//! routed to registry operations by `dispatch`; server events are pushed by
//! the registry and the output pump.

use crate::parser::StreamEvent;
use crate::session::{ChatMessage, SessionError, SessionRegistry, StatusReport};
use crate::state::CliState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Input { content: String },
    Abort,
    Ping,
    GetHistory,
    SendEnter,
    KillSession,
    GetStatus,
    /// Keystrokes passed to the terminal as-is
    Raw { data: String },
    Resize { cols: u16, rows: u16 },
    Save,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        session_id: String,
        reconnected: bool,
        project_path: String,
    },
    /// Raw terminal output
    #[serde(rename = "output")]
    Output { data: String },
    #[serde(rename = "text")]
    Text { content: String },
    #[serde(rename = "thinking")]
    Thinking { content: String },
    #[serde(rename = "tool_use_start")]
    ToolUseStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_use_output", rename_all = "camelCase")]
    ToolUseOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        output: String,
        is_error: bool,
    },
    #[serde(rename = "tool_use_end")]
    ToolUseEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "done", rename_all = "camelCase")]
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        is_error: bool,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "history")]
    History { messages: Vec<ChatMessage> },
    /// Catch-up replay of the whole buffer, sent once per attach
    #[serde(rename = "output-buffer")]
    OutputBuffer { data: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "status")]
    Status(StatusReport),
    #[serde(rename = "state-change")]
    StateChange {
        state: CliState,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

impl From<StreamEvent> for ServerEvent {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Text { text } => ServerEvent::Text { content: text },
            StreamEvent::Thinking { text } => ServerEvent::Thinking { content: text },
            StreamEvent::ToolUseStart { id, name, input } => {
                ServerEvent::ToolUseStart { id, name, input }
            }
            StreamEvent::ToolUseOutput {
                id,
                output,
                is_error,
            } => ServerEvent::ToolUseOutput {
                id,
                output,
                is_error,
            },
            StreamEvent::ToolUseEnd { id } => ServerEvent::ToolUseEnd { id },
            StreamEvent::Done { result, is_error } => ServerEvent::Done { result, is_error },
        }
    }
}

impl From<SessionError> for ServerEvent {
    fn from(e: SessionError) -> Self {
        ServerEvent::error(e.to_string())
    }
}

/// Route one client message. Returns the direct reply, if the message has one.
pub async fn dispatch(
    registry: &SessionRegistry,
    session_id: &str,
    message: ClientMessage,
) -> Result<Option<ServerEvent>, SessionError> {
    if message != ClientMessage::KillSession {
        registry.touch(session_id).await;
    }

    match message {
        ClientMessage::Input { content } => {
            registry.input(session_id, &content).await?;
            Ok(None)
        }
        ClientMessage::Abort => {
            registry.abort(session_id).await?;
            Ok(None)
        }
        ClientMessage::Ping => Ok(Some(ServerEvent::Pong)),
        ClientMessage::GetHistory => Ok(Some(ServerEvent::History {
            messages: registry.history(session_id).await?,
        })),
        ClientMessage::SendEnter => {
            registry.send_enter(session_id).await?;
            Ok(None)
        }
        ClientMessage::KillSession => {
            registry.kill(session_id).await?;
            Ok(None)
        }
        ClientMessage::GetStatus => Ok(Some(ServerEvent::Status(
            registry.status(session_id).await?,
        ))),
        ClientMessage::Raw { data } => {
            registry.send_raw(session_id, data.as_bytes()).await?;
            Ok(None)
        }
        ClientMessage::Resize { cols, rows } => {
            registry.resize(session_id, cols, rows).await?;
            Ok(None)
        }
        ClientMessage::Save => {
            registry.save(session_id).await?;
            Ok(None)
        }
    }
}
