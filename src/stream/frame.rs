//! Single-line frame parsing
//!
//! One complete line of the event stream maps to exactly one [`Frame`].
//! The line arrives as raw bytes; a line that is not valid UTF-8 is a
//! malformed frame, never a fatal error.

use serde::Deserialize;

/// Event-prefix marker in front of each payload
pub const DATA_MARKER: &str = "data:";

/// Payload that ends the stream
pub const DONE_TOKEN: &str = "[DONE]";

/// Classification of one complete line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Blank line (event separator)
    Blank,
    /// `:` comment, used by some providers as a keep-alive
    Comment,
    /// Exact termination token
    Done,
    /// Parsed record; empty when it carried no text
    Delta(Option<String>),
    /// Unparseable payload
    Malformed { reason: String, payload: String },
    /// Provider reported an error inside the stream
    ProviderError(String),
}

/// Parse one line (without its trailing `\n`)
pub fn parse_line(raw: &[u8]) -> Frame {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            return Frame::Malformed {
                reason: format!("invalid UTF-8: {e}"),
                payload: String::from_utf8_lossy(raw).into_owned(),
            };
        }
    };
    let line = text.strip_suffix('\r').unwrap_or(text);

    if line.trim().is_empty() {
        return Frame::Blank;
    }
    if line.starts_with(':') {
        return Frame::Comment;
    }

    let payload = strip_marker(line);
    if payload == DONE_TOKEN {
        return Frame::Done;
    }

    match serde_json::from_str::<ChunkRecord>(payload) {
        Ok(record) => record.into_frame(),
        Err(e) => Frame::Malformed {
            reason: e.to_string(),
            payload: payload.to_string(),
        },
    }
}

/// Remove the `data:` marker and the single space that conventionally follows it
fn strip_marker(line: &str) -> &str {
    match line.strip_prefix(DATA_MARKER) {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    }
}

// Streaming chunk wire types

#[derive(Debug, Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: Option<String>,
}

impl ChunkRecord {
    fn into_frame(self) -> Frame {
        if let Some(error) = self.error {
            return Frame::ProviderError(
                error
                    .message
                    .unwrap_or_else(|| "unknown streaming error".to_string()),
            );
        }

        // Single-completion requests: only the first choice carries our text
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty());

        Frame::Delta(text)
    }
}
