//! Transformers: stateless encoders from a message to bytes.
//!
//! A transformer never blocks and never talks to a transport. Sinks pick one
//! per instance (for HTTP by `Accept` negotiation) and hold their own write
//! gate around each [`Transformer::transform`] call.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde_json::Value;

use crate::envelope::{Envelope, EnvelopeContext};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Actor, Level, OutMessage};

/// Content type written by the ndjson transformer.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
/// Content type written by the JSON transformer.
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type written by the HTML transformer.
pub const HTML_CONTENT_TYPE: &str = "text/html";
/// Content type written by the text transformer.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

const MAX_RENDER_PREVIEW: usize = 2000;

/// Encodes a message for one content type.
pub trait Transformer: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransformerKind;

    fn content_type(&self) -> &'static str;

    /// Only UTF-8 is produced.
    fn charset(&self) -> &'static str {
        "utf-8"
    }

    /// Value for a `Content-Type` header.
    fn content_type_header(&self) -> String {
        format!("{}; charset={}", self.content_type(), self.charset())
    }

    /// Append the encoded message to `out`, returning the number of bytes written.
    fn transform(
        &self,
        ctx: &EnvelopeContext,
        out: &mut BytesMut,
        message: &OutMessage,
    ) -> ProtocolResult<usize>;
}

// ============================================================================
// Negotiation
// ============================================================================

/// The four wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformerKind {
    Text,
    Html,
    Json,
    Plang,
}

impl TransformerKind {
    /// Pick a transformer from an `Accept` header by prefix, in precedence
    /// plang > json > html > text. `fallback` applies only when the header is
    /// missing or blank.
    pub fn negotiate(accept: Option<&str>, fallback: TransformerKind) -> TransformerKind {
        let Some(accept) = accept.map(str::trim).filter(|a| !a.is_empty()) else {
            return fallback;
        };
        let accept = accept.to_ascii_lowercase();

        if accept.starts_with("application/plang") || accept.starts_with("plang/") {
            Self::Plang
        } else if accept.starts_with("application/json") {
            Self::Json
        } else if accept.starts_with("text/html") {
            Self::Html
        } else {
            Self::Text
        }
    }

    /// Exact content-type lookup, used for configured defaults.
    pub fn from_content_type(content_type: &str) -> Option<TransformerKind> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "application/x-ndjson" | "application/plang+jsonl" | "application/plang"
            | "plang/ndjson" => Some(Self::Plang),
            "application/json" | "plang/json" => Some(Self::Json),
            "text/html" => Some(Self::Html),
            "text/plain" | "plain/text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn Transformer> {
        match self {
            Self::Text => Arc::new(TextTransformer::plain()),
            Self::Html => Arc::new(TextTransformer::html()),
            Self::Json => Arc::new(JsonTransformer::json()),
            Self::Plang => Arc::new(JsonTransformer::plang()),
        }
    }
}

// ============================================================================
// Text rendering helpers
// ============================================================================

/// Human readable content of a message, `None` when there is nothing to show.
pub fn text_content(message: &OutMessage) -> Option<String> {
    match message {
        OutMessage::Text(m) => Some(m.content.clone()),
        OutMessage::Render(m) => Some(m.content.clone()),
        OutMessage::Error(m) => Some(match &m.fix_suggestion {
            Some(fix) => format!("{} (fix: {})", m.message, fix),
            None => m.message.clone(),
        }),
        OutMessage::Execute(m) => Some(format!(
            "[Execute] {}({})",
            m.function,
            m.data.as_ref().map(format_value).unwrap_or_default()
        )),
        OutMessage::Ask(m) => Some(m.content.clone()),
        OutMessage::Stream(m) => match (m.text(), m.bytes()) {
            (Some(text), _) => Some(text.to_string()),
            (None, Some(bytes)) => Some(format!("[Binary {} bytes]", bytes.len())),
            (None, None) => None,
        },
    }
}

/// Console flavored content: renders are labeled and truncated.
pub fn console_content(message: &OutMessage) -> Option<String> {
    match message {
        OutMessage::Render(m) => Some(format!("[Render] {}", truncate(&m.content, MAX_RENDER_PREVIEW))),
        other => text_content(other),
    }
}

/// `[channel] [LEVEL] [status] [actor] ` with default parts omitted.
/// Empty for the default channel.
pub fn channel_prefix(message: &OutMessage) -> String {
    let base = message.base();
    if base.is_default_channel() {
        return String::new();
    }

    let mut parts = vec![format!("[{}]", base.channel)];
    if base.level != Level::Info {
        parts.push(format!("[{}]", base.level.as_str().to_ascii_uppercase()));
    }
    if base.status_code != 200 {
        parts.push(format!("[{}]", base.status_code));
    }
    if base.actor != Actor::User {
        parts.push(format!("[{}]", base.actor));
    }
    format!("{} ", parts.join(" "))
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &value[..idx]),
        None => value.to_string(),
    }
}

fn skips_newline(message: &OutMessage) -> bool {
    matches!(message, OutMessage::Text(t) if t.skip_newline)
}

// ============================================================================
// Text / HTML
// ============================================================================

/// Plain text. Default-channel content is written verbatim; other channels get
/// a bracketed prefix and a trailing newline. The HTML flavor never prefixes.
#[derive(Debug, Clone)]
pub struct TextTransformer {
    content_type: &'static str,
    prefix_channels: bool,
}

impl TextTransformer {
    pub fn plain() -> Self {
        Self {
            content_type: TEXT_CONTENT_TYPE,
            prefix_channels: true,
        }
    }

    pub fn html() -> Self {
        Self {
            content_type: HTML_CONTENT_TYPE,
            prefix_channels: false,
        }
    }
}

impl Transformer for TextTransformer {
    fn kind(&self) -> TransformerKind {
        if self.prefix_channels {
            TransformerKind::Text
        } else {
            TransformerKind::Html
        }
    }

    fn content_type(&self) -> &'static str {
        self.content_type
    }

    fn transform(
        &self,
        _ctx: &EnvelopeContext,
        out: &mut BytesMut,
        message: &OutMessage,
    ) -> ProtocolResult<usize> {
        let Some(content) = text_content(message) else {
            return Ok(0);
        };

        let start = out.len();
        if self.prefix_channels && !message.base().is_default_channel() {
            out.put_slice(channel_prefix(message).as_bytes());
            out.put_slice(content.as_bytes());
            if !skips_newline(message) {
                out.put_u8(b'\n');
            }
        } else {
            out.put_slice(content.as_bytes());
        }
        Ok(out.len() - start)
    }
}

// ============================================================================
// JSON / ndjson
// ============================================================================

/// One compact JSON envelope followed by `\n`. The plang flavor differs only in
/// its content type, which announces progressive ndjson delivery.
#[derive(Debug, Clone)]
pub struct JsonTransformer {
    content_type: &'static str,
    streaming: bool,
}

impl JsonTransformer {
    pub fn json() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE,
            streaming: false,
        }
    }

    pub fn plang() -> Self {
        Self {
            content_type: NDJSON_CONTENT_TYPE,
            streaming: true,
        }
    }

    /// Envelope JSON without the trailing newline, for transports that add
    /// their own delimiter.
    pub fn encode(&self, ctx: &EnvelopeContext, message: &OutMessage) -> ProtocolResult<Vec<u8>> {
        let envelope = Envelope::build(message, ctx);
        serde_json::to_vec(&envelope)
            .map_err(|e| ProtocolError::transform(self.name(), e.to_string()))
    }

    fn name(&self) -> &'static str {
        if self.streaming { "plang" } else { "json" }
    }
}

impl Transformer for JsonTransformer {
    fn kind(&self) -> TransformerKind {
        if self.streaming {
            TransformerKind::Plang
        } else {
            TransformerKind::Json
        }
    }

    fn content_type(&self) -> &'static str {
        self.content_type
    }

    fn transform(
        &self,
        ctx: &EnvelopeContext,
        out: &mut BytesMut,
        message: &OutMessage,
    ) -> ProtocolResult<usize> {
        let json = self.encode(ctx, message)?;
        out.reserve(json.len() + 1);
        out.put_slice(&json);
        out.put_u8(b'\n');
        Ok(json.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorMessage;
    use crate::stream::StreamMessage;

    fn render(transformer: &dyn Transformer, message: &OutMessage) -> String {
        let mut out = BytesMut::new();
        let written = transformer
            .transform(&EnvelopeContext::default(), &mut out, message)
            .unwrap();
        assert_eq!(written, out.len());
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_negotiation_precedence() {
        let fallback = TransformerKind::Text;
        assert_eq!(
            TransformerKind::negotiate(
                Some("application/plang+json, application/json;q=0.9"),
                fallback
            ),
            TransformerKind::Plang
        );
        assert_eq!(
            TransformerKind::negotiate(Some("application/json"), fallback),
            TransformerKind::Json
        );
        assert_eq!(
            TransformerKind::negotiate(Some("text/html"), fallback),
            TransformerKind::Html
        );
        assert_eq!(
            TransformerKind::negotiate(Some("image/png"), TransformerKind::Json),
            TransformerKind::Text
        );
        assert_eq!(
            TransformerKind::negotiate(None, TransformerKind::Html),
            TransformerKind::Html
        );
        assert_eq!(
            TransformerKind::negotiate(Some("   "), TransformerKind::Json),
            TransformerKind::Json
        );
    }

    #[test]
    fn test_from_content_type() {
        assert_eq!(
            TransformerKind::from_content_type("application/x-ndjson; charset=utf-8"),
            Some(TransformerKind::Plang)
        );
        assert_eq!(
            TransformerKind::from_content_type("text/plain"),
            Some(TransformerKind::Text)
        );
        assert_eq!(TransformerKind::from_content_type("image/gif"), None);
    }

    #[test]
    fn test_built_transformers_report_their_kind() {
        for kind in [
            TransformerKind::Text,
            TransformerKind::Html,
            TransformerKind::Json,
            TransformerKind::Plang,
        ] {
            assert_eq!(kind.build().kind(), kind);
        }
        assert_eq!(
            TransformerKind::Plang.build().content_type_header(),
            "application/x-ndjson; charset=utf-8"
        );
    }

    #[test]
    fn test_text_default_channel_is_verbatim() {
        let text = TextTransformer::plain();
        assert_eq!(render(&text, &OutMessage::text("hello")), "hello");
    }

    #[test]
    fn test_text_prefix_omits_defaults() {
        let text = TextTransformer::plain();
        let msg = OutMessage::text("disk almost full")
            .with_channel("log")
            .with_level(Level::Warning)
            .with_actor(Actor::System);
        assert_eq!(
            render(&text, &msg),
            "[log] [WARNING] [system] disk almost full\n"
        );

        let msg = OutMessage::text("ok").with_channel("audit").with_status(201);
        assert_eq!(render(&text, &msg), "[audit] [201] ok\n");
    }

    #[test]
    fn test_text_skip_newline() {
        let text = TextTransformer::plain();
        let msg = OutMessage::text("progress").with_channel("log").without_newline();
        assert_eq!(render(&text, &msg), "[log] progress");
    }

    #[test]
    fn test_html_never_prefixes() {
        let html = TextTransformer::html();
        let msg = OutMessage::render("<b>hi</b>").with_channel("log");
        assert_eq!(render(&html, &msg), "<b>hi</b>");
    }

    #[test]
    fn test_text_of_other_kinds() {
        let text = TextTransformer::plain();
        let exec = OutMessage::execute("showToast", Some(serde_json::json!({"n": 1})));
        assert_eq!(render(&text, &exec), "[Execute] showToast({\"n\":1})");

        let mut err = OutMessage::error("Missing key", "MissingKey");
        if let OutMessage::Error(ErrorMessage { fix_suggestion, .. }) = &mut err {
            *fix_suggestion = Some("set API_KEY".to_string());
        }
        assert_eq!(render(&text, &err), "Missing key (fix: set API_KEY)");

        let start: OutMessage = StreamMessage::start("s", "text/plain").into();
        assert_eq!(render(&text, &start), "");
        let chunk: OutMessage = StreamMessage::binary_chunk("s", vec![1u8; 4]).into();
        assert_eq!(render(&text, &chunk), "[Binary 4 bytes]");
    }

    #[test]
    fn test_console_content_truncates_renders() {
        let long = "x".repeat(2100);
        let content = console_content(&OutMessage::render(long)).unwrap();
        assert!(content.starts_with("[Render] "));
        assert!(content.ends_with('…'));
        assert_eq!(content.chars().count(), "[Render] ".len() + 2000 + 1);
    }

    #[test]
    fn test_json_is_single_line() {
        let json = JsonTransformer::json();
        let out = render(&json, &OutMessage::text("line one\nline two"));
        assert!(out.ends_with('\n'));
        assert_eq!(out.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(value["content"], "line one\nline two");
    }

    #[test]
    fn test_ndjson_framing_round_trips() {
        let plang = JsonTransformer::plang();
        let ctx = EnvelopeContext::with_id("ctx");
        let messages = vec![
            OutMessage::text("a"),
            OutMessage::render("<p>b</p>").with_target("#main"),
            OutMessage::execute("fn", Some(serde_json::json!([1, 2]))),
            OutMessage::ask("c?"),
            StreamMessage::text_chunk("s", "d").into(),
            OutMessage::error("e", "E"),
        ];

        let mut out = BytesMut::new();
        for message in &messages {
            plang.transform(&ctx, &mut out, message).unwrap();
        }

        let text = String::from_utf8(out.to_vec()).unwrap();
        let lines: Vec<&str> = text.split('\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), messages.len());
        assert_eq!(text.matches('\n').count(), messages.len());

        for (line, message) in lines.iter().zip(&messages) {
            let parsed: Envelope = serde_json::from_str(line).unwrap();
            assert_eq!(parsed, Envelope::build(message, &ctx));
        }
    }
}
