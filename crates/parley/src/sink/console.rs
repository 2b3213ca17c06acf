//! Terminal sink.

use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use parley_protocol::transform::{channel_prefix, console_content};
use parley_protocol::{AskMessage, Level, OutMessage};
use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Sink;
use crate::error::{ParleyError, ParleyResult};

/// Console sink over the process's standard streams.
pub type StdioConsole = ConsoleSink<BufReader<Stdin>, Stdout>;

/// Line-oriented sink colored by status and level. Asks print the question,
/// then a prompt, then block for one line of input. Asks never time out.
pub struct ConsoleSink<R, W> {
    id: String,
    input: Mutex<R>,
    output: Mutex<W>,
    colors: bool,
    prompt: String,
}

impl StdioConsole {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ConsoleSink<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            id: "console".to_string(),
            input: Mutex::new(input),
            output: Mutex::new(output),
            colors: true,
            prompt: "> ".to_string(),
        }
    }

    pub fn with_colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn into_inner(self) -> (R, W) {
        (self.input.into_inner(), self.output.into_inner())
    }

    fn render(&self, message: &OutMessage) -> Option<String> {
        let content = console_content(message)?;
        let text = format!("{}{}", channel_prefix(message), content);

        let mut line = if self.colors {
            paint(&text, message.level(), message.status_code()).to_string()
        } else {
            text
        };

        let skip_newline = match message {
            OutMessage::Text(t) => t.skip_newline,
            OutMessage::Stream(_) => true,
            _ => false,
        };
        if !skip_newline {
            line.push('\n');
        }
        Some(line)
    }

    async fn write(&self, text: &str) -> ParleyResult<()> {
        let mut output = self.output.lock().await;
        output.write_all(text.as_bytes()).await?;
        output.flush().await?;
        Ok(())
    }
}

/// Fixed thresholds: server errors red on yellow, client errors yellow on red,
/// redirects magenta, informational cyan.
fn paint(text: &str, level: Level, status: u16) -> ColoredString {
    if status >= 500 || level.is_error() {
        text.red().on_yellow()
    } else if status >= 400 || level == Level::Warning {
        text.yellow().on_red()
    } else if matches!(level, Level::Debug | Level::Trace) {
        text.dimmed()
    } else if status >= 300 {
        text.magenta()
    } else if status >= 200 {
        text.normal()
    } else if status >= 100 {
        text.cyan()
    } else {
        text.normal()
    }
}

#[async_trait]
impl<R, W> Sink for ConsoleSink<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
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
        match self.render(&message) {
            Some(line) => self.write(&line).await,
            None => Ok(()),
        }
    }

    async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }

        let question = OutMessage::Ask(message);
        let mut text = self.render(&question).unwrap_or_default();
        text.push_str(&self.prompt);
        self.write(&text).await?;

        let mut input = self.input.lock().await;
        let mut line = String::new();
        tokio::select! {
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
            read = input.read_line(&mut line) => { read?; }
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(Value::String(line)))
    }
}
