//! Sink that forwards messages to the tracing subscriber.

use async_trait::async_trait;
use parley_protocol::transform::text_content;
use parley_protocol::{AskMessage, Level, OutMessage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::Sink;
use crate::error::{ParleyError, ParleyResult};

/// System-side sink for log, audit and metric channels.
#[derive(Debug, Clone)]
pub struct TracingSink {
    id: String,
}

impl TracingSink {
    pub fn new() -> Self {
        Self {
            id: "tracing".to_string(),
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! emit {
    ($level:ident, $message:expr, $content:expr) => {
        tracing::$level!(
            channel = %$message.channel(),
            actor = %$message.actor(),
            kind = %$message.kind(),
            status = $message.status_code(),
            "{}",
            $content
        )
    };
}

#[async_trait]
impl Sink for TracingSink {
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
        let Some(content) = text_content(&message) else {
            return Ok(());
        };

        match message.level() {
            Level::Trace => emit!(trace, message, content),
            Level::Debug => emit!(debug, message, content),
            Level::Info => emit!(info, message, content),
            Level::Warning => emit!(warn, message, content),
            Level::Error | Level::Critical => emit!(error, message, content),
        }
        Ok(())
    }

    async fn ask(
        &self,
        _message: AskMessage,
        _cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        Err(ParleyError::not_supported(&self.id, "ask"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_accepts_every_level() {
        let sink = TracingSink::new();
        let cancel = CancellationToken::new();
        for level in [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warning,
            Level::Error,
            Level::Critical,
        ] {
            let msg = OutMessage::text("metric tick").with_channel("metric").with_level(level);
            sink.send(msg, &cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ask_is_not_supported() {
        let err = TracingSink::new()
            .ask(AskMessage::new("?"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.key(), "NotSupported");
    }
}
