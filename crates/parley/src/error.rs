//! Error types for sinks, routing and ask continuations.

use parley_protocol::{OutMessage, ProtocolError};
use thiserror::Error;

use crate::ask::AskUserError;
use crate::router::MessageType;

/// Result type for parley operations.
pub type ParleyResult<T> = Result<T, ParleyError>;

/// Errors surfaced by sinks, transports and the continuation loop.
///
/// Expected failures (disconnects, serialization, unknown ids) are values of
/// this type; sinks never panic for them.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// An error that needs user input before the flow can continue.
    #[error(transparent)]
    AskUser(AskUserError),

    /// The question was delivered but the answer arrives out of band.
    #[error("awaiting answer for callback {callback_id}")]
    Deferred { callback_id: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The far end of a sink went away.
    #[error("sink {sink} disconnected")]
    Disconnected { sink: String },

    /// Write attempted after the sink or connection was closed.
    #[error("{0} is closed")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// An ask callback failed or panicked.
    #[error("callback {key} failed: {message}")]
    Callback { key: String, message: String },

    #[error("no sink registered for {0}")]
    UnregisteredSink(MessageType),

    #[error("unknown callback: {0}")]
    UnknownCallback(String),

    #[error("conversation exceeded {0} turns")]
    TooManyTurns(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} is not supported by sink {sink}")]
    NotSupported {
        sink: String,
        operation: &'static str,
    },

    #[error("settings error: {0}")]
    Settings(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised by a producer with its own key and status.
    #[error("{message}")]
    Runtime {
        message: String,
        key: String,
        status: u16,
    },
}

impl ParleyError {
    pub fn runtime(message: impl Into<String>, key: impl Into<String>, status: u16) -> Self {
        Self::Runtime {
            message: message.into(),
            key: key.into(),
            status,
        }
    }

    pub fn callback(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn disconnected(sink: impl Into<String>) -> Self {
        Self::Disconnected { sink: sink.into() }
    }

    pub fn not_supported(sink: impl Into<String>, operation: &'static str) -> Self {
        Self::NotSupported {
            sink: sink.into(),
            operation,
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AskUser(ask) => ask.status,
            Self::Deferred { .. } => 202,
            Self::Protocol(e) => e.status_code(),
            Self::Disconnected { .. } | Self::Closed(_) => 410,
            Self::Transport(_) => 502,
            Self::UnknownCallback(_) => 404,
            Self::TooManyTurns(_) => 429,
            Self::Cancelled => 499,
            Self::NotSupported { .. } => 501,
            Self::Callback { .. }
            | Self::UnregisteredSink(_)
            | Self::Settings(_)
            | Self::Io(_) => 500,
            Self::Runtime { status, .. } => *status,
        }
    }

    /// Stable key written into error envelopes.
    pub fn key(&self) -> &str {
        match self {
            Self::AskUser(ask) => &ask.key,
            Self::Deferred { .. } => "AwaitingAnswer",
            Self::Protocol(e) => e.key(),
            Self::Disconnected { .. } => "Disconnected",
            Self::Closed(_) => "Closed",
            Self::Transport(_) => "TransportError",
            Self::Callback { .. } => "CallbackError",
            Self::UnregisteredSink(_) => "UnregisteredSink",
            Self::UnknownCallback(_) => "UnknownCallback",
            Self::TooManyTurns(_) => "TooManyTurns",
            Self::Cancelled => "Cancelled",
            Self::NotSupported { .. } => "NotSupported",
            Self::Settings(_) => "SettingsError",
            Self::Io(_) => "IoError",
            Self::Runtime { key, .. } => key,
        }
    }

    /// Whether the flow can still continue by asking the user.
    pub fn is_askable(&self) -> bool {
        matches!(self, Self::AskUser(_))
    }

    /// Terminal error envelope carrying this error's status and key.
    pub fn to_message(&self) -> OutMessage {
        OutMessage::error(self.to_string(), self.key()).with_status(self.status_code())
    }
}

impl From<AskUserError> for ParleyError {
    fn from(value: AskUserError) -> Self {
        Self::AskUser(value)
    }
}
