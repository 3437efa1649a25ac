//! Terminal output parsing
//!
//! - `classifier`: maps the tail of the output buffer to a `CliState`
//! - `stream`: picks structured JSON events out of the raw byte stream

pub mod classifier;
pub mod stream;

pub use classifier::{classify, Classification};
pub use stream::{StreamEvent, StreamParser};

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences, OSC sequences (BEL or ST terminated) and two-byte escapes
static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?<>=!]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI regex")
});

/// Strip ANSI escape codes from text
pub fn strip_ansi(text: &str) -> String {
    ANSI_PATTERN.replace_all(text, "").to_string()
}
