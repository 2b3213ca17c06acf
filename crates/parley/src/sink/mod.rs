//! Sinks: stateful endpoints that own a transport.
//!
//! A sink writes messages with its transformer and conducts ask round-trips.
//! Expected failures come back as [`ParleyError`] values; every operation
//! takes a cancellation token.

mod console;
mod goal;
mod http;
mod logging;
mod pipe;

pub use console::{ConsoleSink, StdioConsole};
pub use goal::{GoalCall, GoalRunner, GoalSink, MESSAGE_PARAMETER};
pub use http::{
    DEFAULT_BODY_BUFFER, HttpSink, LiveConnection, LiveConnections, PendingResponse,
    ResponseChannel,
};
pub use logging::TracingSink;
pub use pipe::{ConnectionSink, PipeBridge, decode_inbound};

use std::collections::VecDeque;

use async_trait::async_trait;
use parley_protocol::{AskMessage, OutMessage};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ParleyError, ParleyResult};

/// An output endpoint.
#[async_trait]
pub trait Sink: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the sink keeps a transport open across sends.
    fn is_stateful(&self) -> bool;

    /// Deliver one message.
    async fn send(&self, message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()>;

    /// Ask a question. `Ok(None)` means the answer arrives out of band.
    async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>>;
}

/// In-memory sink that records messages and answers asks from a queue.
///
/// When the queue is empty an ask is treated as delivered with the answer
/// arriving out of band.
#[derive(Debug)]
pub struct MemorySink {
    id: String,
    messages: Mutex<Vec<OutMessage>>,
    answers: Mutex<VecDeque<Value>>,
}

impl MemorySink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Mutex::new(Vec::new()),
            answers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_answers<I>(id: impl Into<String>, answers: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            id: id.into(),
            messages: Mutex::new(Vec::new()),
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }

    pub async fn push_answer(&self, answer: Value) {
        self.answers.lock().await.push_back(answer);
    }

    /// Everything sent or asked so far, in order.
    pub async fn messages(&self) -> Vec<OutMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stateful(&self) -> bool {
        false
    }

    async fn send(&self, message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()> {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }
        self.messages.lock().await.push(message.into());
        Ok(self.answers.lock().await.pop_front())
    }
}
