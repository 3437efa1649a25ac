//! Structured event extraction
//!
//! When the CLI runs with a JSON streaming output mode, complete lines that
//! are JSON objects are turned into `StreamEvent`s. Everything else is plain
//! terminal output: lines that fail to parse are skipped silently, that is
//! the common case and not an error.

use super::strip_ansi;
use serde_json::Value;

/// Incomplete lines longer than this are not JSON we can use
const MAX_PENDING_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUseStart {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolUseOutput {
        id: Option<String>,
        output: String,
        is_error: bool,
    },
    ToolUseEnd {
        id: Option<String>,
    },
    Done {
        result: Option<String>,
        is_error: bool,
    },
}

#[derive(Debug, Default)]
pub struct StreamParser {
    pending_line: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decoded terminal text; returns events for every complete JSON line.
    ///
    /// The incomplete tail is kept raw, so an escape sequence split across
    /// two reads is stripped once the line is whole.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut combined = std::mem::take(&mut self.pending_line);
        combined.push_str(chunk);

        let ends_with_newline = combined.ends_with('\n');
        let mut lines = combined.split('\n').peekable();
        let mut events = Vec::new();

        while let Some(line) = lines.next() {
            // Keep the incomplete last line for the next chunk
            if !ends_with_newline && lines.peek().is_none() {
                if line.len() <= MAX_PENDING_LINE && could_become_json(line) {
                    self.pending_line = line.to_string();
                }
                break;
            }
            events.extend(parse_line(strip_ansi(line).trim_end_matches('\r')));
        }

        events
    }
}

/// An unfinished line worth carrying: empty, an opening brace, or an
/// escape sequence that is not complete yet.
fn could_become_json(line: &str) -> bool {
    let text = strip_ansi(line);
    let trimmed = text.trim_start();
    trimmed.is_empty() || trimmed.starts_with('{') || trimmed.starts_with('\x1b')
}

/// Parse one complete line. Non-JSON and unrecognized shapes yield nothing.
pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::trace!("Ignoring non-event line: {}", e);
            return Vec::new();
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") | Some("user") => value
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| blocks.iter().flat_map(parse_block).collect())
            .unwrap_or_default(),
        Some("content_block_delta") => parse_delta(&value).into_iter().collect(),
        Some("result") => vec![StreamEvent::Done {
            result: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }],
        Some(_) => parse_block(&value),
        None => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Vec<StreamEvent> {
    let str_field = |key: &str| block.get(key).and_then(Value::as_str).map(str::to_string);

    match block.get("type").and_then(Value::as_str) {
        Some("text") => str_field("text")
            .map(|text| vec![StreamEvent::Text { text }])
            .unwrap_or_default(),
        Some("thinking") => str_field("thinking")
            .or_else(|| str_field("text"))
            .map(|text| vec![StreamEvent::Thinking { text }])
            .unwrap_or_default(),
        Some("tool_use") => match str_field("name") {
            Some(name) => vec![StreamEvent::ToolUseStart {
                id: str_field("id"),
                name,
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }],
            None => Vec::new(),
        },
        Some("tool_result") => {
            let id = str_field("tool_use_id");
            vec![
                StreamEvent::ToolUseOutput {
                    id: id.clone(),
                    output: flatten_content(block.get("content")),
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                },
                StreamEvent::ToolUseEnd { id },
            ]
        }
        _ => Vec::new(),
    }
}

fn parse_delta(value: &Value) -> Option<StreamEvent> {
    let delta = value.get("delta")?;
    match delta.get("type").and_then(Value::as_str)? {
        "text_delta" => Some(StreamEvent::Text {
            text: delta.get("text")?.as_str()?.to_string(),
        }),
        "thinking_delta" => Some(StreamEvent::Thinking {
            text: delta.get("thinking")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

/// Tool results carry either a string or a list of content blocks
fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
