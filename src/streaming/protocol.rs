//! Progress event protocol.
//!
//! Events travel as Server-Sent-Events text frames:
//!
//! ```text
//! event: progress
//! data: {"type":"progress","percent":40,"message":"scanning"}
//!
//! ```
//!
//! The JSON body carries the same `type` discriminator as the `event:` line,
//! so either is enough to classify a frame. `complete` and `error` are
//! terminal; `progress` and `heartbeat` are not.

use crate::error::ErrorCode;
use crate::model::{Usage, Version};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted `data` payload for one event.
pub const MAX_EVENT_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        percent: u8,
        message: String,
    },
    Heartbeat,
    Complete {
        result: Value,
        version: Version,
        usage: Usage,
    },
    Error {
        message: String,
        #[serde(default)]
        code: ErrorCode,
    },
}

impl StreamEvent {
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        StreamEvent::Progress {
            percent: percent.min(100),
            message: message.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    /// Encode as one SSE frame, including the blank line terminator.
    pub fn encode(&self) -> Bytes {
        // Serializing this enum cannot fail: every field is a plain value or
        // an already-valid `serde_json::Value`.
        let body = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        let name = self.name();

        let mut buf = BytesMut::with_capacity(16 + name.len() + body.len());
        buf.put_slice(b"event: ");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\ndata: ");
        buf.put_slice(body.as_bytes());
        buf.put_slice(b"\n\n");
        buf.freeze()
    }
}

/// A frame that arrived intact but could not be classified.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed {} event: {reason}", .event.as_deref().unwrap_or("unnamed"))]
pub struct MalformedEvent {
    pub event: Option<String>,
    pub reason: String,
}

/// Write one event and flush it so nothing sits in a buffer.
pub async fn write_event<W: AsyncWrite + Unpin>(w: &mut W, event: &StreamEvent) -> std::io::Result<()> {
    w.write_all(&event.encode()).await?;
    w.flush().await
}

/// Incremental SSE decoder over any byte stream.
pub struct EventReader<R> {
    inner: BufReader<R>,
    line: String,
    event: Option<String>,
    data: String,
    has_data: bool,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
            event: None,
            data: String::new(),
            has_data: false,
        }
    }

    /// Next frame, or `None` at end of stream.
    ///
    /// The outer error is a transport failure; the inner one is a single bad
    /// frame after which reading can continue. A frame cut off by EOF is
    /// discarded.
    pub async fn next_event(&mut self) -> std::io::Result<Option<Result<StreamEvent, MalformedEvent>>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }

            let line = self.line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.has_data || self.event.is_some() {
                    return Ok(Some(self.dispatch()));
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.data.push('\n');
                    }
                    self.data.push_str(value);
                    self.has_data = true;
                    if self.data.len() > MAX_EVENT_SIZE {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("event data exceeds {} bytes", MAX_EVENT_SIZE),
                        ));
                    }
                }
                _ => {}
            }
        }
    }

    fn dispatch(&mut self) -> Result<StreamEvent, MalformedEvent> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        self.has_data = false;

        let malformed = |reason: String| MalformedEvent {
            event: event.clone(),
            reason,
        };

        let mut body: Value = if data.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&data).map_err(|e| malformed(e.to_string()))?
        };

        let Some(object) = body.as_object_mut() else {
            return Err(malformed("data is not a JSON object".to_string()));
        };

        match (object.get("type").and_then(Value::as_str), event.as_deref()) {
            (Some(tag), Some(name)) if tag != name => {
                return Err(malformed(format!("event name {:?} does not match type {:?}", name, tag)));
            }
            (None, Some(name)) => {
                object.insert("type".to_string(), Value::String(name.to_string()));
            }
            (None, None) => return Err(malformed("missing event type".to_string())),
            _ => {}
        }

        serde_json::from_value(body).map_err(|e| malformed(e.to_string()))
    }
}
