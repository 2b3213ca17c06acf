//! Message model, wire envelope and transformers for the parley output protocol.
//!
//! This crate is pure data plus encoding: it never touches a transport. The
//! `parley` crate builds sinks, routing and the ask/continuation loop on top.

pub mod envelope;
pub mod error;
pub mod message;
pub mod stream;
pub mod transform;

pub use envelope::{Envelope, EnvelopeContext};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    AUDIT_CHANNEL, Actor, AskMessage, CallbackInfo, DEFAULT_CHANNEL, ErrorMessage,
    ExecuteMessage, GoalRef, LOG_CHANNEL, Level, METRIC_CHANNEL, MessageBase, MessageKind, Meta,
    OutMessage, RenderMessage, SECURITY_CHANNEL, TextMessage,
};
pub use stream::{StreamMessage, StreamPayload, StreamPhase, StreamTracker};
pub use transform::{JsonTransformer, TextTransformer, Transformer, TransformerKind};
