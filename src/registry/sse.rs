//! Server-sent event framing for the realtime database stream

use super::{RegistryError, RegistryEvent};
use serde::Deserialize;
use serde_json::Value;

/// One dispatched SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes arrive in arbitrary chunks; complete lines are consumed and a frame is
/// emitted on each blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.line_buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.line_buffer.drain(..=newline_index).collect::<Vec<_>>();
            if matches!(line.last(), Some(b'\n')) {
                line.pop();
            }
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }

            if let Some(frame) = self.consume_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    fn consume_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Realtime database stream message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Put(RegistryEvent),
    Patch(RegistryEvent),
    KeepAlive,
    Cancel(String),
    AuthRevoked,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    path: String,
    data: Value,
}

impl StreamMessage {
    /// Interpret a frame according to the database streaming protocol
    pub fn from_frame(frame: &SseFrame) -> Result<Self, RegistryError> {
        let decode = |data: &str| -> Result<RegistryEvent, RegistryError> {
            let payload: ChangePayload = serde_json::from_str(data)
                .map_err(|e| RegistryError::Decode(format!("{} event: {}", frame.event, e)))?;
            Ok(RegistryEvent::new(payload.path, payload.data))
        };

        Ok(match frame.event.as_str() {
            "put" => Self::Put(decode(&frame.data)?),
            "patch" => Self::Patch(decode(&frame.data)?),
            "keep-alive" => Self::KeepAlive,
            "cancel" => Self::Cancel(frame.data.clone()),
            "auth_revoked" => Self::AuthRevoked,
            other => Self::Unknown(other.to_string()),
        })
    }
}
