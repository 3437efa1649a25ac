//! CLI state classification from terminal output
//!
//! Works on the last few hundred characters of the session buffer. Rules are
//! evaluated top-down and the first match wins. Markers routinely co-occur
//! on screen (the ready prompt stays visible under a spinner, tool bullets
//! stay visible after the tool finished), so the order below is the actual
//! precedence:
//!
//! 1. paste confirmation → `waiting_confirm`
//! 2. ready prompt → `idle`
//! 3. thinking spinner → `thinking`
//! 4. tool invocation → `tool_running` (known tools, MCP tools, generic `⏺ Name(`)
//! 5. response bullet → `responding`
//! 6. nothing matched → `unknown`

use super::strip_ansi;
use crate::state::CliState;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub state: CliState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl Classification {
    fn new(state: CliState) -> Self {
        Self { state, tool: None }
    }
}

static PASTE_CONFIRM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[Pasted text[^\]]*\]|Press Enter to paste").expect("valid paste regex")
});

static READY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)\? for shortcuts|^[\s│|]*[>❯][\s\u{a0}]*[│|]?[ \t]*$")
        .expect("valid ready regex")
});

static THINKING_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bthinking\b|[✻✳✢✶✽·*]\s*[A-Z][a-z]+…").expect("valid thinking regex")
});

static KNOWN_TOOL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|[^A-Za-z0-9_])(Bash|Read|Write|Edit|MultiEdit|Glob|Grep|LS|WebFetch|WebSearch|Task|TodoWrite|NotebookEdit|NotebookRead)\(",
    )
    .expect("valid known tool regex")
});

static MCP_TOOL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(mcp__[A-Za-z0-9_-]+)\(").expect("valid mcp tool regex"));

static GENERIC_TOOL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[⏺●]\s*([A-Za-z][A-Za-z0-9_.:-]*)\(").expect("valid generic tool regex")
});

static RESPONDING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[⏺●]").expect("valid responding regex"));

type Matcher = fn(&str) -> Option<Classification>;

struct Rule {
    name: &'static str,
    matcher: Matcher,
}

fn marker(pattern: &Regex, text: &str, state: CliState) -> Option<Classification> {
    pattern.is_match(text).then(|| Classification::new(state))
}

/// Last (most recent) capture of the first group
fn last_capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
}

fn match_tool(text: &str) -> Option<Classification> {
    [&*KNOWN_TOOL_PATTERN, &*MCP_TOOL_PATTERN, &*GENERIC_TOOL_PATTERN]
        .into_iter()
        .find_map(|pattern| last_capture(pattern, text))
        .map(|tool| Classification {
            state: CliState::ToolRunning,
            tool: Some(tool),
        })
}

fn match_paste_confirm(text: &str) -> Option<Classification> {
    marker(&PASTE_CONFIRM_PATTERN, text, CliState::WaitingConfirm)
}

fn match_ready(text: &str) -> Option<Classification> {
    marker(&READY_PATTERN, text, CliState::Idle)
}

fn match_thinking(text: &str) -> Option<Classification> {
    marker(&THINKING_PATTERN, text, CliState::Thinking)
}

fn match_responding(text: &str) -> Option<Classification> {
    marker(&RESPONDING_PATTERN, text, CliState::Responding)
}

static RULES: &[Rule] = &[
    Rule {
        name: "paste_confirm",
        matcher: match_paste_confirm,
    },
    Rule {
        name: "ready",
        matcher: match_ready,
    },
    Rule {
        name: "thinking",
        matcher: match_thinking,
    },
    Rule {
        name: "tool",
        matcher: match_tool,
    },
    Rule {
        name: "responding",
        matcher: match_responding,
    },
];

/// Classify a tail window of raw terminal output.
pub fn classify(tail: &str) -> Classification {
    let text = strip_ansi(tail);
    for rule in RULES {
        if let Some(result) = (rule.matcher)(&text) {
            tracing::trace!("Classifier rule {} matched", rule.name);
            return result;
        }
    }
    Classification::new(CliState::Unknown)
}
