//! Ask-error continuations.
//!
//! An [`AskUserError`] is an error that is also a continuation: it carries a
//! question and a callback that, given the user's answers, either resolves the
//! flow or produces the next [`AskUserError`]. [`BaseErrorHandler`] drives
//! that chain until it reaches a terminal state.

mod handler;
mod private_key;

pub use handler::{
    AskOutcome, AskUserHandler, BaseErrorHandler, DEFAULT_PENDING_TTL_SECS, PendingAsk,
    PendingAsks, RunMode, SinkAskHandler,
};
pub use private_key::{
    DecisionClassifier, DecisionLevel, DecisionRecord, HttpClassifier, KeywordClassifier,
    LOCKED_KEY, PRIVATE_KEY_EXPORT_KEY, PrivateKeyExport,
};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use parley_protocol::{Actor, AskMessage, DEFAULT_CHANNEL, Meta};
use serde_json::Value;
use tracing::warn;

use crate::error::ParleyError;

/// Result of resolving an error: whether the flow should continue, and the
/// error that is still outstanding (if any).
pub type Handled = (bool, Option<ParleyError>);

type AskCallback =
    Box<dyn FnOnce(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Handled>> + Send + Sync>;

/// Default key of an ask error.
pub const ASK_USER_KEY: &str = "AskUser";

/// An error that asks the user a question and resumes with the answer.
pub struct AskUserError {
    pub message: String,
    pub key: String,
    pub status: u16,
    pub actor: Actor,
    pub channel: String,
    pub callback_data: Option<Meta>,
    callback: AskCallback,
}

impl AskUserError {
    pub fn new<F, Fut>(message: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Handled>> + Send + 'static,
    {
        Self {
            message: message.into(),
            key: ASK_USER_KEY.to_string(),
            status: 200,
            actor: Actor::User,
            channel: DEFAULT_CHANNEL.to_string(),
            callback_data: None,
            callback: Box::new(move |answers| callback(answers).boxed()),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_callback_data(mut self, data: Meta) -> Self {
        self.callback_data = Some(data);
        self
    }

    /// The question as an ask message addressed like this error.
    pub fn to_ask(&self) -> AskMessage {
        let mut ask = AskMessage::new(self.message.clone());
        ask.base.status_code = self.status;
        ask.base.actor = self.actor;
        ask.base.channel = self.channel.clone();
        ask.callback_data = self.callback_data.clone();
        ask
    }

    /// Run the continuation with the user's answers.
    ///
    /// Errors and panics raised by the callback come back as
    /// [`ParleyError::Callback`] instead of unwinding into the caller.
    pub async fn invoke_callback(self, answers: Vec<Value>) -> Handled {
        let key = self.key;
        let callback = self.callback;

        let future = match std::panic::catch_unwind(AssertUnwindSafe(move || callback(answers))) {
            Ok(future) => future,
            Err(panic) => return callback_failure(&key, panic_message(panic.as_ref())),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(handled)) => handled,
            Ok(Err(err)) => callback_failure(&key, format!("{err:#}")),
            Err(panic) => callback_failure(&key, panic_message(panic.as_ref())),
        }
    }
}

fn callback_failure(key: &str, message: String) -> Handled {
    warn!(key = %key, "ask callback failed: {}", message);
    (false, Some(ParleyError::callback(key, message)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl fmt::Debug for AskUserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AskUserError")
            .field("message", &self.message)
            .field("key", &self.key)
            .field("status", &self.status)
            .field("actor", &self.actor)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AskUserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AskUserError {}

/// Flatten answers into one line of text.
pub fn answer_text(answers: &[Value]) -> String {
    answers
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn a raw sink answer into the callback's argument list.
pub fn answers_from(value: Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values,
        other => vec![other],
    }
}
