//! Server-Sent Events messages and their wire framing.
//!
//! Messages travel from the application to the SSE bridge over an unbounded
//! channel. The bridge turns each one into `field: value` lines terminated by
//! a blank line.
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Byte order mark optionally written at the start of an event stream.
pub const EVENT_STREAM_BOM: &str = "\u{feff}";

/// One event on a live event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    comment: Option<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data: Option<String>,
}

impl SseMessage {
    /// A plain `message` event. Multi-line data becomes several `data:` lines.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// A comment line, ignored by clients; useful as a keep-alive.
    pub fn comment(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Self::default()
        }
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry.as_millis() as u64);
        self
    }

    /// Serialize to event-stream lines, each including its trailing `\n`.
    /// The final entry is the blank line that dispatches the event.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(comment) = &self.comment {
            lines.extend(split_lines(comment).map(|line| format!(": {line}\n")));
        }
        if let Some(event) = &self.event {
            lines.push(format!("event: {}\n", single_line(event)));
        }
        if let Some(id) = &self.id {
            lines.push(format!("id: {}\n", single_line(id)));
        }
        if let Some(retry) = self.retry {
            lines.push(format!("retry: {retry}\n"));
        }
        if let Some(data) = &self.data {
            lines.extend(split_lines(data).map(|line| format!("data: {line}\n")));
        }

        lines.push("\n".to_string());
        lines
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.lines().concat())
    }
}

impl From<&str> for SseMessage {
    fn from(data: &str) -> Self {
        Self::new(data)
    }
}

impl From<String> for SseMessage {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<serde_json::Value> for SseMessage {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value.to_string())
    }
}

// CRLF, lone CR and LF all end a line on the client side.
fn split_lines(value: &str) -> impl Iterator<Item = &str> {
    value.split("\r\n").flat_map(|part| part.split(['\r', '\n']))
}

// Field values other than data must not break the line structure.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], "")
}

/// Application side of an SSE session.
pub type SseSender = mpsc::UnboundedSender<SseMessage>;

/// Bridge side of an SSE session; carried by the `sse` outcome.
pub type SsePort = mpsc::UnboundedReceiver<SseMessage>;

/// Create a connected sender/port pair.
pub fn sse_channel() -> (SseSender, SsePort) {
    mpsc::unbounded_channel()
}
