//! Outbound message model.
//!
//! Every message a producer hands to the output layer is an [`OutMessage`]:
//! one of six kinds sharing a common [`MessageBase`] (level, status, target,
//! actions, channel, actor, meta). Messages are plain data; encoding happens
//! in [`crate::transform`] and delivery in the sinks of the `parley` crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::stream::StreamMessage;

/// Default channel name.
pub const DEFAULT_CHANNEL: &str = "default";
/// Recognized channel for log output.
pub const LOG_CHANNEL: &str = "log";
/// Recognized channel for audit records.
pub const AUDIT_CHANNEL: &str = "audit";
/// Recognized channel for security events.
pub const SECURITY_CHANNEL: &str = "security";
/// Recognized channel for metrics.
pub const METRIC_CHANNEL: &str = "metric";

/// Opaque passthrough key/values carried end-to-end.
pub type Meta = BTreeMap<String, Value>;

// ============================================================================
// Shared enums
// ============================================================================

/// Severity of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Error or critical.
    pub fn is_error(&self) -> bool {
        *self >= Self::Error
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(ProtocolError::UnknownLevel(s.to_string())),
        }
    }
}

/// Who a message is conceptually addressed to or from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    #[default]
    User,
    System,
    /// Client side of a transport connection.
    Service,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "service" => Ok(Self::Service),
            _ => Err(ProtocolError::UnknownActor(s.to_string())),
        }
    }
}

/// Discriminant of [`OutMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Render,
    Error,
    Execute,
    Ask,
    Stream,
}

impl MessageKind {
    /// Actions applied when the producer does not name any.
    pub fn default_actions(&self) -> &'static [&'static str] {
        match self {
            Self::Text => &["append"],
            Self::Render => &["replace"],
            Self::Error => &["notify"],
            Self::Execute => &[],
            Self::Ask => &["ask"],
            Self::Stream => &["stream"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Render => "render",
            Self::Error => "error",
            Self::Execute => "execute",
            Self::Ask => "ask",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Base fields
// ============================================================================

/// Fields shared by every message kind.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBase {
    pub level: Level,
    /// HTTP-style status; also drives console colors.
    pub status_code: u16,
    /// Placement hint for the consumer UI. Never interpreted here.
    pub target: Option<String>,
    /// Explicit actions. `None` means "use the kind's defaults".
    pub actions: Option<Vec<String>>,
    pub channel: String,
    pub actor: Actor,
    pub meta: Option<Meta>,
}

impl MessageBase {
    pub fn with_status(status_code: u16) -> Self {
        Self {
            status_code,
            ..Self::default()
        }
    }

    pub fn is_default_channel(&self) -> bool {
        self.channel.is_empty() || self.channel.eq_ignore_ascii_case(DEFAULT_CHANNEL)
    }
}

impl Default for MessageBase {
    fn default() -> Self {
        Self {
            level: Level::Info,
            status_code: 200,
            target: None,
            actions: None,
            channel: DEFAULT_CHANNEL.to_string(),
            actor: Actor::User,
            meta: None,
        }
    }
}

// ============================================================================
// Concrete kinds
// ============================================================================

/// Plain text appended to the consumer's output.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub base: MessageBase,
    pub content: String,
    pub skip_newline: bool,
}

/// Full replacement of a UI region.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderMessage {
    pub base: MessageBase,
    pub content: String,
}

/// Terminal, non-resumable notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub base: MessageBase,
    pub message: String,
    pub key: String,
    pub fix_suggestion: Option<String>,
    pub helpful_links: Option<String>,
}

/// Invoke a named client-side function with a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteMessage {
    pub base: MessageBase,
    pub function: String,
    pub data: Option<Value>,
}

/// Reference to a goal the interpreter should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl GoalRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }
}

/// Correlates an out-of-band answer with a parked continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackInfo {
    pub id: String,
    /// Where the consumer should post the answer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A question for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct AskMessage {
    pub base: MessageBase,
    pub content: String,
    /// State threaded through the answer round-trip.
    pub callback_data: Option<Meta>,
    pub on_callback: Option<GoalRef>,
    pub callback: Option<CallbackInfo>,
}

impl AskMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            base: MessageBase::default(),
            content: content.into(),
            callback_data: None,
            on_callback: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: CallbackInfo) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_callback_data(mut self, data: Meta) -> Self {
        self.callback_data = Some(data);
        self
    }

    pub fn with_on_callback(mut self, goal: GoalRef) -> Self {
        self.on_callback = Some(goal);
        self
    }
}

// ============================================================================
// OutMessage
// ============================================================================

/// A runtime-produced message, immutable once handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum OutMessage {
    Text(TextMessage),
    Render(RenderMessage),
    Error(ErrorMessage),
    Execute(ExecuteMessage),
    Ask(AskMessage),
    Stream(StreamMessage),
}

impl OutMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(TextMessage {
            base: MessageBase::default(),
            content: content.into(),
            skip_newline: false,
        })
    }

    pub fn render(content: impl Into<String>) -> Self {
        Self::Render(RenderMessage {
            base: MessageBase::default(),
            content: content.into(),
        })
    }

    pub fn error(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Error(ErrorMessage {
            base: MessageBase {
                level: Level::Error,
                ..MessageBase::with_status(500)
            },
            message: message.into(),
            key: key.into(),
            fix_suggestion: None,
            helpful_links: None,
        })
    }

    pub fn execute(function: impl Into<String>, data: Option<Value>) -> Self {
        Self::Execute(ExecuteMessage {
            base: MessageBase::default(),
            function: function.into(),
            data,
        })
    }

    pub fn ask(content: impl Into<String>) -> Self {
        Self::Ask(AskMessage::new(content))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Render(_) => MessageKind::Render,
            Self::Error(_) => MessageKind::Error,
            Self::Execute(_) => MessageKind::Execute,
            Self::Ask(_) => MessageKind::Ask,
            Self::Stream(_) => MessageKind::Stream,
        }
    }

    pub fn base(&self) -> &MessageBase {
        match self {
            Self::Text(m) => &m.base,
            Self::Render(m) => &m.base,
            Self::Error(m) => &m.base,
            Self::Execute(m) => &m.base,
            Self::Ask(m) => &m.base,
            Self::Stream(m) => &m.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut MessageBase {
        match self {
            Self::Text(m) => &mut m.base,
            Self::Render(m) => &mut m.base,
            Self::Error(m) => &mut m.base,
            Self::Execute(m) => &mut m.base,
            Self::Ask(m) => &mut m.base,
            Self::Stream(m) => &mut m.base,
        }
    }

    pub fn level(&self) -> Level {
        self.base().level
    }

    pub fn status_code(&self) -> u16 {
        self.base().status_code
    }

    pub fn channel(&self) -> &str {
        &self.base().channel
    }

    pub fn actor(&self) -> Actor {
        self.base().actor
    }

    pub fn target(&self) -> Option<&str> {
        self.base().target.as_deref()
    }

    /// Explicit actions, or the kind's defaults when none were given.
    pub fn actions(&self) -> Vec<String> {
        match &self.base().actions {
            Some(actions) => actions.clone(),
            None => self
                .kind()
                .default_actions()
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }

    /// Whether the producer named the actions explicitly.
    pub fn has_explicit_actions(&self) -> bool {
        self.base()
            .actions
            .as_ref()
            .is_some_and(|actions| !actions.is_empty())
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.base_mut().level = level;
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.base_mut().status_code = status_code;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.base_mut().target = Some(target.into());
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_mut().actions = Some(actions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.base_mut().channel = channel.into();
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.base_mut().actor = actor;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.base_mut()
            .meta
            .get_or_insert_with(Meta::new)
            .insert(key.into(), value);
        self
    }

    /// Suppress the trailing newline of a text message. No-op for other kinds.
    pub fn without_newline(mut self) -> Self {
        if let Self::Text(text) = &mut self {
            text.skip_newline = true;
        }
        self
    }
}

impl From<TextMessage> for OutMessage {
    fn from(value: TextMessage) -> Self {
        Self::Text(value)
    }
}

impl From<RenderMessage> for OutMessage {
    fn from(value: RenderMessage) -> Self {
        Self::Render(value)
    }
}

impl From<ErrorMessage> for OutMessage {
    fn from(value: ErrorMessage) -> Self {
        Self::Error(value)
    }
}

impl From<ExecuteMessage> for OutMessage {
    fn from(value: ExecuteMessage) -> Self {
        Self::Execute(value)
    }
}

impl From<AskMessage> for OutMessage {
    fn from(value: AskMessage) -> Self {
        Self::Ask(value)
    }
}

impl From<StreamMessage> for OutMessage {
    fn from(value: StreamMessage) -> Self {
        Self::Stream(value)
    }
}
