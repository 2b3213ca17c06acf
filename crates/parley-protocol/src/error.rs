//! Protocol error types.

use thiserror::Error;

use crate::stream::StreamPhase;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, decoding or encoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A transformer failed to serialize a message.
    #[error("transform failed ({transformer}): {message}")]
    Transform {
        transformer: &'static str,
        message: String,
    },

    /// An inbound envelope could not be turned into a message.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Unknown level name.
    #[error("unknown level: {0}")]
    UnknownLevel(String),

    /// Unknown actor name.
    #[error("unknown actor: {0}")]
    UnknownActor(String),

    /// A stream phase arrived out of order.
    #[error("stream {stream_id}: phase {phase} not allowed after {previous}")]
    StreamOrder {
        stream_id: String,
        phase: StreamPhase,
        previous: String,
    },

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn transform(transformer: &'static str, message: impl Into<String>) -> Self {
        Self::Transform {
            transformer,
            message: message.into(),
        }
    }

    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        Self::InvalidEnvelope(message.into())
    }

    /// Stable key used in error envelopes.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Transform { .. } => "TransformError",
            Self::InvalidEnvelope(_) => "InvalidEnvelope",
            Self::UnknownLevel(_) => "UnknownLevel",
            Self::UnknownActor(_) => "UnknownActor",
            Self::StreamOrder { .. } => "StreamOrder",
            Self::Json(_) => "JsonError",
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Transform { .. } | Self::Json(_) => 500,
            _ => 400,
        }
    }
}
