//! Streamed content: phases, payloads and ordering.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::MessageBase;

/// Phase of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Start,
    Chunk,
    End,
    Abort,
}

impl StreamPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Chunk => "chunk",
            Self::End => "end",
            Self::Abort => "abort",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Abort)
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk carries text or bytes, never both.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StreamPayload {
    #[default]
    None,
    Text(String),
    Binary(Bytes),
}

/// One phase of a stream, correlated by `stream_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub base: MessageBase,
    pub stream_id: String,
    pub phase: StreamPhase,
    pub payload: StreamPayload,
    pub content_type: String,
    pub file_name: Option<String>,
}

impl StreamMessage {
    fn new(stream_id: impl Into<String>, phase: StreamPhase, payload: StreamPayload) -> Self {
        Self {
            base: MessageBase::default(),
            stream_id: stream_id.into(),
            phase,
            payload,
            content_type: "application/octet-stream".to_string(),
            file_name: None,
        }
    }

    pub fn start(stream_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        let mut msg = Self::new(stream_id, StreamPhase::Start, StreamPayload::None);
        msg.content_type = content_type.into();
        msg
    }

    pub fn text_chunk(stream_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut msg = Self::new(stream_id, StreamPhase::Chunk, StreamPayload::Text(text.into()));
        msg.content_type = "text/plain".to_string();
        msg
    }

    pub fn binary_chunk(stream_id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(
            stream_id,
            StreamPhase::Chunk,
            StreamPayload::Binary(bytes.into()),
        )
    }

    pub fn end(stream_id: impl Into<String>) -> Self {
        Self::new(stream_id, StreamPhase::End, StreamPayload::None)
    }

    pub fn abort(stream_id: impl Into<String>) -> Self {
        Self::new(stream_id, StreamPhase::Abort, StreamPayload::None)
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            StreamPayload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            StreamPayload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn has_binary(&self) -> bool {
        matches!(self.payload, StreamPayload::Binary(_))
    }
}

/// Enforces Start -> Chunk* -> (End | Abort) per stream id.
#[derive(Debug, Default)]
pub struct StreamTracker {
    open: HashMap<String, StreamPhase>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a phase, rejecting it when it breaks the ordering.
    pub fn observe(&mut self, message: &StreamMessage) -> ProtocolResult<()> {
        let previous = self.open.get(&message.stream_id).copied();
        let allowed = match (message.phase, previous) {
            (StreamPhase::Start, None) => true,
            (StreamPhase::Start, Some(_)) => false,
            (_, None) => false,
            (_, Some(_)) => true,
        };

        if !allowed {
            return Err(ProtocolError::StreamOrder {
                stream_id: message.stream_id.clone(),
                phase: message.phase,
                previous: previous
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "nothing".to_string()),
            });
        }

        if message.phase.is_terminal() {
            self.open.remove(&message.stream_id);
        } else {
            self.open.insert(message.stream_id.clone(), message.phase);
        }
        Ok(())
    }

    /// Streams started but not yet ended or aborted.
    pub fn open_streams(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }
}
