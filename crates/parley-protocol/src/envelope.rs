//! Wire envelope shared by the JSON and ndjson transformers.
//!
//! One [`Envelope`] is the serialized form of one [`OutMessage`]. The same
//! shape is accepted inbound (HTTP API, transport connections) and decoded
//! back into a message with `OutMessage::try_from`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{
    Actor, AskMessage, CallbackInfo, DEFAULT_CHANNEL, ErrorMessage, ExecuteMessage, GoalRef,
    Level, MessageBase, MessageKind, Meta, OutMessage, RenderMessage, TextMessage,
};
use crate::stream::{StreamMessage, StreamPayload, StreamPhase};

/// Per-write context threaded explicitly into every transform call.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeContext {
    /// Request or execution id stamped on each envelope.
    pub id: Option<String>,
    /// Attached as `debug` when present.
    pub debug: Option<Value>,
}

impl EnvelopeContext {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            debug: None,
        }
    }
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_status() -> u16 {
    200
}

/// Structural envelope: `{kind, channel, level, status, target, actions, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: MessageKind,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,

    // text | render | error | ask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_newline: bool,

    // error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helpful_links: Option<String>,

    // execute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    // ask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_callback: Option<GoalRef>,

    // stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<StreamPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_binary: Option<bool>,
    /// Base64 encoded binary chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl Envelope {
    fn bare(message: &OutMessage, ctx: &EnvelopeContext) -> Self {
        let base = message.base();
        Self {
            id: ctx.id.clone(),
            kind: message.kind(),
            channel: base.channel.clone(),
            level: base.level,
            status: base.status_code,
            target: base.target.clone(),
            actions: Some(message.actions()),
            actor: base.actor,
            meta: base.meta.clone().filter(|meta| !meta.is_empty()),
            content: None,
            skip_newline: false,
            key: None,
            fix_suggestion: None,
            helpful_links: None,
            function: None,
            data: None,
            callback: None,
            callback_data: None,
            on_callback: None,
            stream_id: None,
            phase: None,
            text: None,
            has_binary: None,
            bytes: None,
            file_name: None,
            content_type: None,
            debug: ctx.debug.clone(),
        }
    }

    /// Build the envelope for a message.
    pub fn build(message: &OutMessage, ctx: &EnvelopeContext) -> Self {
        let mut env = Self::bare(message, ctx);
        match message {
            OutMessage::Text(m) => {
                env.content = Some(m.content.clone());
                env.skip_newline = m.skip_newline;
            }
            OutMessage::Render(m) => {
                env.content = Some(m.content.clone());
            }
            OutMessage::Error(m) => {
                env.content = Some(m.message.clone());
                env.key = Some(m.key.clone());
                env.fix_suggestion = m.fix_suggestion.clone();
                env.helpful_links = m.helpful_links.clone();
            }
            OutMessage::Execute(m) => {
                env.function = Some(m.function.clone());
                env.data = m.data.clone().filter(|v| !v.is_null());
            }
            OutMessage::Ask(m) => {
                env.content = Some(m.content.clone());
                env.callback = m.callback.clone();
                env.callback_data = m.callback_data.clone();
                env.on_callback = m.on_callback.clone();
            }
            OutMessage::Stream(m) => {
                env.stream_id = Some(m.stream_id.clone());
                env.phase = Some(m.phase);
                env.text = m.text().map(str::to_string);
                env.has_binary = Some(m.has_binary());
                env.bytes = m.bytes().map(|b| BASE64.encode(b));
                env.file_name = m.file_name.clone();
                env.content_type = Some(m.content_type.clone());
            }
        }
        env
    }

    fn require(field: Option<String>, name: &str, kind: MessageKind) -> ProtocolResult<String> {
        field.ok_or_else(|| {
            ProtocolError::invalid_envelope(format!("{kind} envelope is missing `{name}`"))
        })
    }
}

impl TryFrom<Envelope> for OutMessage {
    type Error = ProtocolError;

    fn try_from(env: Envelope) -> Result<Self, ProtocolError> {
        let base = MessageBase {
            level: env.level,
            status_code: env.status,
            target: env.target,
            actions: env.actions.filter(|actions| !actions.is_empty()),
            channel: if env.channel.is_empty() {
                default_channel()
            } else {
                env.channel
            },
            actor: env.actor,
            meta: env.meta,
        };
        let kind = env.kind;

        let message = match kind {
            MessageKind::Text => OutMessage::Text(TextMessage {
                base,
                content: Envelope::require(env.content, "content", kind)?,
                skip_newline: env.skip_newline,
            }),
            MessageKind::Render => OutMessage::Render(RenderMessage {
                base,
                content: Envelope::require(env.content, "content", kind)?,
            }),
            MessageKind::Error => OutMessage::Error(ErrorMessage {
                base,
                message: Envelope::require(env.content, "content", kind)?,
                key: env.key.unwrap_or_else(|| "Error".to_string()),
                fix_suggestion: env.fix_suggestion,
                helpful_links: env.helpful_links,
            }),
            MessageKind::Execute => OutMessage::Execute(ExecuteMessage {
                base,
                function: Envelope::require(env.function, "function", kind)?,
                data: env.data,
            }),
            MessageKind::Ask => OutMessage::Ask(AskMessage {
                base,
                content: Envelope::require(env.content, "content", kind)?,
                callback_data: env.callback_data,
                on_callback: env.on_callback,
                callback: env.callback,
            }),
            MessageKind::Stream => {
                let payload = match (env.text, env.bytes) {
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::invalid_envelope(
                            "stream chunk carries both `text` and `bytes`",
                        ));
                    }
                    (Some(text), None) => StreamPayload::Text(text),
                    (None, Some(encoded)) => {
                        let raw = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                            ProtocolError::invalid_envelope(format!("bytes are not base64: {e}"))
                        })?;
                        StreamPayload::Binary(raw.into())
                    }
                    (None, None) => StreamPayload::None,
                };
                OutMessage::Stream(StreamMessage {
                    base,
                    stream_id: Envelope::require(env.stream_id, "streamId", kind)?,
                    phase: env.phase.ok_or_else(|| {
                        ProtocolError::invalid_envelope("stream envelope is missing `phase`")
                    })?,
                    payload,
                    content_type: env
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    file_name: env.file_name,
                })
            }
        };
        Ok(message)
    }
}
