//! Request and execution contexts, passed explicitly to sinks.

use std::sync::Arc;

use parley_protocol::{Actor, EnvelopeContext, OutMessage};
use serde_json::json;
use uuid::Uuid;

use crate::sink::Sink;

/// Placement defaults applied to messages that do not name their own.
#[derive(Debug, Clone, Default)]
pub struct ResponseProperties {
    pub target: Option<String>,
    pub actions: Option<Vec<String>>,
}

/// Per-request state threaded into every sink and transform call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    /// Live connection identity, when the request has one.
    pub identity: Option<String>,
    pub path: Option<String>,
    /// Attach a `debug` object to every envelope.
    pub debug: bool,
    pub response: ResponseProperties,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: None,
            path: None,
            debug: false,
            response: ResponseProperties::default(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_response(mut self, response: ResponseProperties) -> Self {
        self.response = response;
        self
    }

    pub fn envelope_context(&self) -> EnvelopeContext {
        EnvelopeContext {
            id: Some(self.id.clone()),
            debug: self.debug.then(|| {
                json!({
                    "requestId": self.id,
                    "identity": self.identity,
                    "path": self.path,
                })
            }),
        }
    }

    /// Fill in target and actions the producer left empty.
    pub fn apply_response_properties(&self, message: &mut OutMessage) {
        let base = message.base_mut();
        if base.target.is_none() {
            base.target = self.response.target.clone();
        }
        if base.actions.as_ref().is_none_or(|a| a.is_empty())
            && let Some(actions) = &self.response.actions
        {
            base.actions = Some(actions.clone());
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets producers address "the current user" or "the system" without knowing
/// which concrete sink is behind either.
#[derive(Clone)]
pub struct ExecutionContext {
    user: Arc<dyn Sink>,
    system: Arc<dyn Sink>,
}

impl ExecutionContext {
    pub fn new(user: Arc<dyn Sink>, system: Arc<dyn Sink>) -> Self {
        Self { user, system }
    }

    /// `"user"` selects the user sink; empty, `"system"` and anything else the
    /// system sink.
    pub fn get_sink(&self, actor: &str) -> Arc<dyn Sink> {
        if actor.trim().eq_ignore_ascii_case(Actor::User.as_str()) {
            self.user.clone()
        } else {
            self.system.clone()
        }
    }

    pub fn sink_for(&self, actor: Actor) -> Arc<dyn Sink> {
        match actor {
            Actor::User => self.user.clone(),
            Actor::System | Actor::Service => self.system.clone(),
        }
    }
}
