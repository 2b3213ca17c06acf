//! Sinks over transport connections, and the handler that wires connections
//! into the router.

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{AskMessage, Envelope, OutMessage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Sink;
use crate::error::ParleyResult;
use crate::router::SinkRouter;
use crate::transport::{Connection, ConnectionHandler};

/// Writes messages to one connection. Asks are half-duplex: the answer comes
/// back as an ordinary inbound message.
pub struct ConnectionSink {
    id: String,
    connection: Arc<Connection>,
}

impl ConnectionSink {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            id: sink_id(&connection),
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

#[async_trait]
impl Sink for ConnectionSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stateful(&self) -> bool {
        true
    }

    async fn send(&self, message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()> {
        self.connection.send_with(&message, cancel).await
    }

    async fn ask(
        &self,
        message: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<Option<Value>> {
        self.send(OutMessage::Ask(message), cancel).await?;
        Ok(None)
    }
}

fn sink_id(connection: &Connection) -> String {
    format!("pipe:{}", connection.id())
}

/// Decode one inbound segment. JSON envelopes become their message; anything
/// else is plain text on the connection's channel. The connection's actor is
/// stamped on either.
pub fn decode_inbound(connection: &Connection, raw: &str) -> OutMessage {
    let decoded = if raw.trim_start().starts_with('{') {
        serde_json::from_str::<Envelope>(raw)
            .ok()
            .and_then(|env| OutMessage::try_from(env).ok())
    } else {
        None
    };

    let mut message = decoded.unwrap_or_else(|| OutMessage::text(raw));
    let base = message.base_mut();
    base.actor = connection.actor();
    if base.is_default_channel() {
        base.channel = connection.channel().to_string();
    }
    message
}

/// Registers each connection as a named channel on the router for its
/// lifetime and forwards inbound messages to `inbound`.
pub struct PipeBridge {
    router: Arc<SinkRouter>,
    inbound: Arc<dyn Sink>,
}

impl PipeBridge {
    pub fn new(router: Arc<SinkRouter>, inbound: Arc<dyn Sink>) -> Self {
        Self { router, inbound }
    }
}

#[async_trait]
impl ConnectionHandler for PipeBridge {
    async fn on_connect(&self, connection: Arc<Connection>) {
        info!(connection = %connection.id(), channel = %connection.channel(), "pipe connected");
        let sink = Arc::new(ConnectionSink::new(connection.clone()));
        self.router
            .register_channel(connection.actor(), connection.channel(), sink);
    }

    async fn on_message(&self, connection: Arc<Connection>, message: String) {
        let message = decode_inbound(&connection, &message);
        debug!(connection = %connection.id(), kind = %message.kind(), "pipe message");
        if let Err(e) = self.inbound.send(message, &CancellationToken::new()).await {
            warn!(connection = %connection.id(), "failed to deliver pipe message: {}", e);
        }
    }

    async fn on_disconnect(&self, connection: Arc<Connection>) {
        self.router.unregister_channel(
            connection.actor(),
            connection.channel(),
            &sink_id(&connection),
        );
        info!(connection = %connection.id(), "pipe disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::transport::{ConnectionManager, TransportOptions};
    use parley_protocol::{Actor, Level};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_bridge_registers_and_forwards() {
        let inbound = Arc::new(MemorySink::new("inbound"));
        let router = Arc::new(
            SinkRouter::builder()
                .user(Arc::new(MemorySink::new("user")))
                .build(),
        );
        let bridge = Arc::new(PipeBridge::new(router.clone(), inbound.clone()));
        let manager = ConnectionManager::new(TransportOptions::default());

        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = manager.attach(local, true, "pipe", bridge);

        wait_for(|| !router.channel_names().is_empty()).await;

        // outbound through the router lands on the connection
        router
            .send(OutMessage::text("to pipe").with_channel("pipe"), &CancellationToken::new())
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let n = remote.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.contains("\"content\":\"to pipe\""));
        assert!(line.ends_with('\n'));

        // inbound text and envelopes are decoded and forwarded
        remote.write_all(b"plain text\n").await.unwrap();
        remote
            .write_all(b"{\"kind\":\"text\",\"content\":\"json\",\"level\":\"warning\"}\n")
            .await
            .unwrap();
        let inbound_seen = inbound.clone();
        for _ in 0..200 {
            if inbound_seen.messages().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let messages = inbound.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel(), "pipe");
        assert_eq!(messages[0].actor(), Actor::User);
        assert_eq!(messages[1].level(), Level::Warning);

        // closing deregisters the channel
        assert!(manager.close(conn.id()).await);
        wait_for(|| router.channel_names().is_empty()).await;
        assert!(manager.is_empty());
    }
}
