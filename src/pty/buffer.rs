//! Session output buffer
//!
//! Append-only text accumulator that keeps only the most recent `limit`
//! characters. Raw PTY chunks may split a UTF-8 sequence; the incomplete
//! trailing bytes are carried over to the next write instead of being
//! replaced, so the retained text is exactly the tail of the decoded stream.

/// Returns the trailing `limit` characters of `text`.
pub fn tail_chars(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    let skip = count - limit;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    limit: usize,
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            pending: Vec::new(),
        }
    }

    /// Rebuild a buffer from persisted output.
    pub fn restore(text: &str, limit: usize) -> Self {
        let mut buf = Self::new(limit);
        buf.push_str(text);
        buf
    }

    /// Decode a raw chunk and append it. Returns the decoded text that was
    /// appended (empty when the chunk only held part of a UTF-8 sequence).
    pub fn push_bytes(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(data);

        let mut decoded = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    decoded.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.push_str(&decoded);
        decoded
    }

    pub fn push_str(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let added = data.chars().count();
        self.text.push_str(data);
        self.chars += added;

        if self.chars > self.limit {
            let excess = self.chars - self.limit;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.limit;
        }
    }

    /// Trailing `n` characters, used as the classifier window.
    pub fn tail(&self, n: usize) -> &str {
        if self.chars <= n {
            return &self.text;
        }
        let skip = self.chars - n;
        match self.text.char_indices().nth(skip) {
            Some((idx, _)) => &self.text[idx..],
            None => "",
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
