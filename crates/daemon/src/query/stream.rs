//! Incremental parsing of newline-delimited stream-json output.
//!
//! Each line is one JSON record. The runner only cares about two things in a
//! record: a `session_id` (the resume token) and text deltas, which appear
//! either bare or wrapped in a `stream_event` envelope.

use serde::Deserialize;

/// Splits a byte stream into complete lines, keeping the trailing partial
/// line until more data (or EOF) arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed, without the newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Returns the unterminated final line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        Some(decode_line(&rest))
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Delta payloads inside a `content_block_delta` record.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// The record shapes the runner extracts text from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRecord {
    ContentBlockDelta {
        delta: Delta,
    },
    StreamEvent {
        event: Box<StreamRecord>,
    },
    #[serde(other)]
    Other,
}

impl StreamRecord {
    fn into_text(self) -> Option<String> {
        match self {
            StreamRecord::ContentBlockDelta {
                delta: Delta::TextDelta { text },
            } => Some(text),
            StreamRecord::StreamEvent { event } => event.into_text(),
            _ => None,
        }
    }
}

/// What one line contributed to the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLine {
    /// A resume token carried by the record.
    pub session_id: Option<String>,
    /// A text delta carried by the record.
    pub text: Option<String>,
}

/// Parses one line. Returns `None` for blank lines and lines that are not JSON
/// objects.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    if !value.is_object() {
        return None;
    }

    let session_id = value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let text = serde_json::from_value::<StreamRecord>(value)
        .ok()
        .and_then(StreamRecord::into_text)
        .filter(|t| !t.is_empty());

    Some(ParsedLine { session_id, text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_complete_lines() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn line_buffer_keeps_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.finish().as_deref(), Some("{\"b\""));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_handles_split_utf8_and_crlf() {
        let mut buf = LineBuffer::new();
        let bytes = "caf\u{e9}\r\n".as_bytes();
        assert!(buf.push(&bytes[..4]).is_empty());
        assert_eq!(buf.push(&bytes[4..]), vec!["caf\u{e9}"]);
    }

    #[test]
    fn parse_top_level_text_delta() {
        let line = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("Hi"));
        assert_eq!(parsed.session_id, None);
    }

    #[test]
    fn parse_wrapped_text_delta_with_session() {
        let line = r#"{"type":"stream_event","session_id":"s-1","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"there"}}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("there"));
        assert_eq!(parsed.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn parse_session_only_record() {
        let parsed = parse_line(r#"{"session_id":"abc"}"#).unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("abc"));
        assert_eq!(parsed.text, None);
    }

    #[test]
    fn parse_ignores_other_deltas_and_records() {
        let thinking = r#"{"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"hmm"}}"#;
        assert_eq!(parse_line(thinking).unwrap().text, None);

        let system = r#"{"type":"system","subtype":"init","session_id":"x"}"#;
        let parsed = parse_line(system).unwrap();
        assert_eq!(parsed.text, None);
        assert_eq!(parsed.session_id.as_deref(), Some("x"));
    }

    #[test]
    fn parse_ignores_non_string_session_id() {
        let parsed = parse_line(r#"{"session_id":42}"#).unwrap();
        assert_eq!(parsed.session_id, None);
    }

    #[test]
    fn parse_drops_malformed_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("not json"), None);
        assert_eq!(parse_line("{\"type\":"), None);
        assert_eq!(parse_line("[1,2]"), None);
    }
}
