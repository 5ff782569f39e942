//! Query stream events.
//!
//! A query request produces a `text/event-stream` response where every event
//! is a single `data: <json>` line followed by a blank line. The stream ends
//! with exactly one [`QueryEvent::Done`] unless the requester went away.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Request body for a one-shot query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Prompt text handed to the subprocess.
    pub message: String,
    /// Resume token from a previous `done` event.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One event of a query response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    /// Incremental text delta.
    Text { content: String },
    /// Diagnostic output of a failed subprocess.
    Error { content: String },
    /// Terminal event carrying the resume token, if one is known.
    Done {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
}

impl QueryEvent {
    pub fn text(content: impl Into<String>) -> Self {
        QueryEvent::Text {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        QueryEvent::Error {
            content: content.into(),
        }
    }

    pub fn done(session_id: Option<String>) -> Self {
        QueryEvent::Done { session_id }
    }

    /// Returns true for the `done` event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done { .. })
    }

    /// Encode the JSON payload of a `data:` line.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse the payload of a `data:` line.
    pub fn from_data(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| ProtocolError::MalformedEvent(e.to_string()))
    }
}

/// Incremental decoder for an event-stream body.
///
/// Bytes are buffered until a blank line completes an event, so chunk
/// boundaries may fall anywhere, including inside a UTF-8 sequence.
/// Comment lines (keep-alives) are skipped.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<QueryEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let block = String::from_utf8_lossy(&block[..pos]);

            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();

            if data.is_empty() {
                continue;
            }
            events.push(QueryEvent::from_data(&data.join("\n")));
        }
        events
    }

    /// Bytes held back waiting for the end of an event.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}
