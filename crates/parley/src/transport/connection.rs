//! One bidirectional byte-stream connection.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use parley_protocol::{Actor, EnvelopeContext, JsonTransformer, OutMessage};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ParleyError, ParleyResult};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a connection plus its lifecycle state.
///
/// Writes are serialized by a single-slot lock. Closing is idempotent and may
/// race with reads, writes and other closes.
pub struct Connection {
    id: String,
    channel: String,
    is_server: bool,
    delimiter: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    encoder: JsonTransformer,
}

impl Connection {
    pub(crate) fn new(
        channel: &str,
        is_server: bool,
        delimiter: &str,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            is_server,
            delimiter: delimiter.to_string(),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
            encoder: JsonTransformer::json(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Accepted by a listener (as opposed to dialed out).
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// `user` for accepted connections, `service` for outbound ones.
    pub fn actor(&self) -> Actor {
        if self.is_server {
            Actor::User
        } else {
            Actor::Service
        }
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Closed locally, by the peer, or after an abandoned frame.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write a message as a JSON envelope followed by the delimiter.
    pub async fn send(&self, message: &OutMessage) -> ParleyResult<()> {
        self.send_with(message, &CancellationToken::new()).await
    }

    /// [`send`](Self::send), giving up while waiting for the write lock when
    /// `cancel` fires. A frame that has started is always written whole.
    pub async fn send_with(
        &self,
        message: &OutMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<()> {
        let mut bytes = self
            .encoder
            .encode(&EnvelopeContext::with_id(&self.id), message)?;
        bytes.extend_from_slice(self.delimiter.as_bytes());
        self.write_bytes(&bytes, cancel).await
    }

    /// Write raw text followed by the delimiter.
    pub async fn send_text(&self, text: &str) -> ParleyResult<()> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(self.delimiter.as_bytes());
        self.write_bytes(&bytes, &CancellationToken::new()).await
    }

    async fn write_bytes(&self, bytes: &[u8], cancel: &CancellationToken) -> ParleyResult<()> {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }
        let mut slot = tokio::select! {
            biased;
            slot = self.writer.lock() => slot,
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
        };
        let writer = match slot.as_mut() {
            Some(writer) if !self.is_closed() => writer,
            _ => return Err(ParleyError::Closed(format!("connection {}", self.id))),
        };

        let frame = FrameGuard::new(self);
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        frame.finish();

        if let Err(e) = result {
            debug!("write to connection {} failed: {}", self.id, e);
            drop(slot);
            self.close().await;
            return Err(ParleyError::disconnected(format!("connection {}", self.id)));
        }
        Ok(())
    }

    /// Close the connection. Returns `false` when it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!("connection {} closed", self.id);
        true
    }
}

/// Poisons the connection when a write future is dropped mid-frame: the
/// peer has a partial frame, so nothing else may be written after it.
struct FrameGuard<'a> {
    connection: &'a Connection,
    finished: bool,
}

impl<'a> FrameGuard<'a> {
    fn new(connection: &'a Connection) -> Self {
        Self {
            connection,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "write to connection {} abandoned mid-frame, closing",
                self.connection.id
            );
            self.connection.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("is_server", &self.is_server)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
