//! Sink that hands messages to another goal of the interpreter.

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{AskMessage, Envelope, EnvelopeContext, GoalRef, Meta, OutMessage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Sink;
use crate::error::{ParleyError, ParleyResult};

/// Parameter name under which the message envelope is passed to the goal.
pub const MESSAGE_PARAMETER: &str = "plang.message";

/// One goal invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalCall {
    pub goal: GoalRef,
    pub parameters: Meta,
}

/// Runs goals. Implemented by the interpreter host.
#[async_trait]
pub trait GoalRunner: Send + Sync {
    async fn run(&self, call: GoalCall) -> anyhow::Result<Option<Value>>;
}

/// Routes each message by calling a goal with the message attached; the goal's
/// return value is the ask answer.
pub struct GoalSink {
    id: String,
    goal: GoalRef,
    parameters: Meta,
    runner: Arc<dyn GoalRunner>,
}

impl GoalSink {
    pub fn new(goal: GoalRef, runner: Arc<dyn GoalRunner>) -> Self {
        Self {
            id: format!("goal:{}", goal.name),
            goal,
            parameters: Meta::new(),
            runner,
        }
    }

    /// Extra parameters passed on every call.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    async fn call(&self, message: &OutMessage, cancel: &CancellationToken) -> ParleyResult<Option<Value>> {
        let envelope = Envelope::build(message, &EnvelopeContext::default());
        let mut parameters = self.parameters.clone();
        parameters.insert(
            MESSAGE_PARAMETER.to_string(),
            serde_json::to_value(envelope).map_err(parley_protocol::ProtocolError::from)?,
        );

        let call = GoalCall {
            goal: self.goal.clone(),
            parameters,
        };
        debug!(goal = %self.goal.name, kind = %message.kind(), "calling goal sink");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
            result = self.runner.run(call) => result,
        };
        result.map_err(|e| ParleyError::runtime(format!("{e:#}"), "GoalCallFailed", 500))
    }
}

#[async_trait]
impl Sink for GoalSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stateful(&self) -> bool {
        false
    }

    async fn send(&self, message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()> {
        self.call(&message, cancel).await.map(|_| ())
    }

    async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        self.call(&OutMessage::Ask(message), cancel).await
    }
}
