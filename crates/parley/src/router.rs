//! Channel/actor routing from messages to sinks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parley_protocol::{
    AUDIT_CHANNEL, Actor, AskMessage, LOG_CHANNEL, Level, METRIC_CHANNEL, MessageBase, MessageKind,
    OutMessage, SECURITY_CHANNEL,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::{ParleyError, ParleyResult};
use crate::sink::Sink;

/// Channel carrying application events.
pub const EVENT_CHANNEL: &str = "event";
/// Channel carrying notifications.
pub const NOTIFICATION_CHANNEL: &str = "notification";

/// Named instances of the (actor, channel) cross product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    UserOutput,
    UserAsk,
    UserError,
    UserNotification,
    SystemOutput,
    SystemError,
    SystemAsk,
    SystemNotification,
    SystemMetrics,
    SystemAudit,
    SystemEvent,
    SystemDebug,
    SystemWarning,
    SystemLog,
    SystemTrace,
}

impl MessageType {
    pub const USER: [MessageType; 4] = [
        Self::UserOutput,
        Self::UserAsk,
        Self::UserError,
        Self::UserNotification,
    ];

    pub const SYSTEM: [MessageType; 11] = [
        Self::SystemOutput,
        Self::SystemError,
        Self::SystemAsk,
        Self::SystemNotification,
        Self::SystemMetrics,
        Self::SystemAudit,
        Self::SystemEvent,
        Self::SystemDebug,
        Self::SystemWarning,
        Self::SystemLog,
        Self::SystemTrace,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::UserOutput => "UserOutput",
            Self::UserAsk => "UserAsk",
            Self::UserError => "UserError",
            Self::UserNotification => "UserNotification",
            Self::SystemOutput => "SystemOutput",
            Self::SystemError => "SystemError",
            Self::SystemAsk => "SystemAsk",
            Self::SystemNotification => "SystemNotification",
            Self::SystemMetrics => "SystemMetrics",
            Self::SystemAudit => "SystemAudit",
            Self::SystemEvent => "SystemEvent",
            Self::SystemDebug => "SystemDebug",
            Self::SystemWarning => "SystemWarning",
            Self::SystemLog => "SystemLog",
            Self::SystemTrace => "SystemTrace",
        }
    }

    pub fn is_user(&self) -> bool {
        Self::USER.contains(self)
    }

    /// Classify a message by actor, kind, level and channel.
    pub fn classify(message: &OutMessage) -> MessageType {
        let base = message.base();
        let kind = message.kind();
        let is_error = kind == MessageKind::Error || base.level.is_error();
        let channel = base.channel.to_ascii_lowercase();
        let default_channel = base.is_default_channel();

        if base.actor == Actor::User {
            return if kind == MessageKind::Ask {
                Self::UserAsk
            } else if is_error {
                Self::UserError
            } else if default_channel {
                Self::UserOutput
            } else {
                Self::UserNotification
            };
        }

        if kind == MessageKind::Ask {
            return Self::SystemAsk;
        }
        if is_error {
            return Self::SystemError;
        }
        match channel.as_str() {
            METRIC_CHANNEL => return Self::SystemMetrics,
            AUDIT_CHANNEL | SECURITY_CHANNEL => return Self::SystemAudit,
            LOG_CHANNEL => return Self::SystemLog,
            EVENT_CHANNEL => return Self::SystemEvent,
            NOTIFICATION_CHANNEL => return Self::SystemNotification,
            _ => {}
        }
        match base.level {
            Level::Warning => Self::SystemWarning,
            Level::Debug => Self::SystemDebug,
            Level::Trace => Self::SystemTrace,
            _ if default_channel => Self::SystemOutput,
            _ => Self::SystemEvent,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps message types to sinks, with runtime-registered named channels taking
/// precedence over classification.
pub struct SinkRouter {
    routes: HashMap<MessageType, Arc<dyn Sink>>,
    named: DashMap<(Actor, String), Arc<dyn Sink>>,
}

impl SinkRouter {
    pub fn builder() -> SinkRouterBuilder {
        SinkRouterBuilder::default()
    }

    pub fn sink_for(&self, message_type: MessageType) -> Option<Arc<dyn Sink>> {
        self.routes.get(&message_type).cloned()
    }

    /// Sink that should handle `message`.
    pub fn resolve(&self, message: &OutMessage) -> ParleyResult<Arc<dyn Sink>> {
        self.resolve_base(message.base(), MessageType::classify(message))
    }

    fn resolve_base(
        &self,
        base: &MessageBase,
        message_type: MessageType,
    ) -> ParleyResult<Arc<dyn Sink>> {
        if !base.is_default_channel()
            && let Some(sink) = self
                .named
                .get(&(base.actor, base.channel.to_ascii_lowercase()))
        {
            return Ok(sink.value().clone());
        }

        self.sink_for(message_type)
            .ok_or(ParleyError::UnregisteredSink(message_type))
    }

    /// Register a sink for a named channel, replacing any previous one.
    pub fn register_channel(&self, actor: Actor, name: &str, sink: Arc<dyn Sink>) {
        info!(actor = %actor, channel = %name, sink = %sink.id(), "registered channel");
        self.named.insert((actor, name.to_ascii_lowercase()), sink);
    }

    /// Remove a named channel if it still points at `sink_id`.
    pub fn unregister_channel(&self, actor: Actor, name: &str, sink_id: &str) -> bool {
        let removed = self
            .named
            .remove_if(&(actor, name.to_ascii_lowercase()), |_, sink| {
                sink.id() == sink_id
            })
            .is_some();
        if removed {
            info!(actor = %actor, channel = %name, "unregistered channel");
        }
        removed
    }

    /// Actor-addressed view over the user and system output sinks.
    pub fn execution_context(&self) -> ParleyResult<ExecutionContext> {
        let user = self
            .sink_for(MessageType::UserOutput)
            .ok_or(ParleyError::UnregisteredSink(MessageType::UserOutput))?;
        let system = self
            .sink_for(MessageType::SystemOutput)
            .ok_or(ParleyError::UnregisteredSink(MessageType::SystemOutput))?;
        Ok(ExecutionContext::new(user, system))
    }

    pub fn channel_names(&self) -> Vec<(Actor, String)> {
        self.named.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn send(&self, message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()> {
        let sink = self.resolve(&message)?;
        debug!(sink = %sink.id(), kind = %message.kind(), "routing message");
        sink.send(message, cancel).await
    }

    pub async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        let message_type = if message.base.actor == Actor::User {
            MessageType::UserAsk
        } else {
            MessageType::SystemAsk
        };
        let sink = self.resolve_base(&message.base, message_type)?;
        debug!(sink = %sink.id(), "routing ask");
        sink.ask(message, cancel).await
    }
}

/// Builds the static type-to-sink table.
#[derive(Default)]
pub struct SinkRouterBuilder {
    routes: HashMap<MessageType, Arc<dyn Sink>>,
}

impl SinkRouterBuilder {
    /// Route every user-facing type to `sink`.
    pub fn user(mut self, sink: Arc<dyn Sink>) -> Self {
        for message_type in MessageType::USER {
            self.routes.insert(message_type, sink.clone());
        }
        self
    }

    /// Route every system type to `sink`.
    pub fn system(mut self, sink: Arc<dyn Sink>) -> Self {
        for message_type in MessageType::SYSTEM {
            self.routes.insert(message_type, sink.clone());
        }
        self
    }

    pub fn route(mut self, message_type: MessageType, sink: Arc<dyn Sink>) -> Self {
        self.routes.insert(message_type, sink);
        self
    }

    pub fn build(self) -> SinkRouter {
        SinkRouter {
            routes: self.routes,
            named: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn classify(message: OutMessage) -> MessageType {
        MessageType::classify(&message)
    }

    #[test]
    fn test_classify_user_messages() {
        assert_eq!(classify(OutMessage::text("hi")), MessageType::UserOutput);
        assert_eq!(classify(OutMessage::ask("?")), MessageType::UserAsk);
        assert_eq!(classify(OutMessage::error("x", "X")), MessageType::UserError);
        assert_eq!(
            classify(OutMessage::text("x").with_level(Level::Critical)),
            MessageType::UserError
        );
        assert_eq!(
            classify(OutMessage::text("x").with_channel("toast")),
            MessageType::UserNotification
        );
    }

    #[test]
    fn test_classify_system_messages() {
        let system = |msg: OutMessage| classify(msg.with_actor(Actor::System));
        assert_eq!(system(OutMessage::text("x")), MessageType::SystemOutput);
        assert_eq!(system(OutMessage::ask("?")), MessageType::SystemAsk);
        assert_eq!(system(OutMessage::error("x", "X")), MessageType::SystemError);
        assert_eq!(
            system(OutMessage::text("x").with_channel("metric")),
            MessageType::SystemMetrics
        );
        assert_eq!(
            system(OutMessage::text("x").with_channel("security")),
            MessageType::SystemAudit
        );
        assert_eq!(
            system(OutMessage::text("x").with_channel("log")),
            MessageType::SystemLog
        );
        assert_eq!(
            system(OutMessage::text("x").with_channel("notification")),
            MessageType::SystemNotification
        );
        assert_eq!(
            system(OutMessage::text("x").with_level(Level::Warning)),
            MessageType::SystemWarning
        );
        assert_eq!(
            system(OutMessage::text("x").with_level(Level::Debug)),
            MessageType::SystemDebug
        );
        assert_eq!(
            system(OutMessage::text("x").with_level(Level::Trace)),
            MessageType::SystemTrace
        );
        assert_eq!(
            system(OutMessage::text("x").with_channel("deploys")),
            MessageType::SystemEvent
        );
        // service connections are system side
        assert_eq!(
            classify(OutMessage::text("x").with_actor(Actor::Service)),
            MessageType::SystemOutput
        );
    }

    #[tokio::test]
    async fn test_router_dispatches_by_actor() {
        let user = Arc::new(MemorySink::new("user"));
        let system = Arc::new(MemorySink::new("system"));
        let router = SinkRouter::builder()
            .user(user.clone())
            .system(system.clone())
            .build();
        let cancel = CancellationToken::new();

        router.send(OutMessage::text("for user"), &cancel).await.unwrap();
        router
            .send(OutMessage::text("for ops").with_actor(Actor::System), &cancel)
            .await
            .unwrap();

        assert_eq!(user.messages().await.len(), 1);
        assert_eq!(system.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_an_error() {
        let router = SinkRouter::builder()
            .user(Arc::new(MemorySink::new("user")))
            .build();
        let err = router
            .send(
                OutMessage::text("x").with_actor(Actor::System).with_channel("metric"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::UnregisteredSink(MessageType::SystemMetrics)));
    }

    #[tokio::test]
    async fn test_named_channel_takes_precedence() {
        let user = Arc::new(MemorySink::new("user"));
        let pipe = Arc::new(MemorySink::new("pipe-1"));
        let router = SinkRouter::builder().user(user.clone()).build();
        router.register_channel(Actor::User, "Pipe", pipe.clone());
        let cancel = CancellationToken::new();

        router
            .send(OutMessage::text("x").with_channel("pipe"), &cancel)
            .await
            .unwrap();
        assert_eq!(pipe.messages().await.len(), 1);
        assert!(user.messages().await.is_empty());

        assert!(!router.unregister_channel(Actor::User, "pipe", "pipe-2"));
        assert!(router.unregister_channel(Actor::User, "pipe", "pipe-1"));
        router
            .send(OutMessage::text("x").with_channel("pipe"), &cancel)
            .await
            .unwrap();
        assert_eq!(user.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ask_goes_to_ask_sink() {
        let user = Arc::new(MemorySink::new("user"));
        let asker = Arc::new(MemorySink::with_answers("asker", [json!("42")]));
        let router = SinkRouter::builder()
            .user(user)
            .route(MessageType::UserAsk, asker.clone())
            .build();

        let answer = router
            .ask(AskMessage::new("Answer?"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer, Some(json!("42")));
        assert_eq!(asker.messages().await.len(), 1);
    }
}
