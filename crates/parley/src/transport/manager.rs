//! Connection registry, accept loops and per-connection read loops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::framing::{DEFAULT_DELIMITER, DEFAULT_MAX_FRAME, MessageFramer};
use crate::error::{ParleyError, ParleyResult};

/// Default number of inbound messages queued per connection.
pub const DEFAULT_DISPATCH_QUEUE: usize = 64;

/// Framing and buffering options shared by all connections of a manager.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub delimiter: String,
    pub read_buffer: usize,
    /// Largest inbound message; a peer exceeding it is disconnected.
    pub max_frame: usize,
    /// Framed messages waiting for the handler before reading pauses.
    pub dispatch_queue: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            read_buffer: 4096,
            max_frame: DEFAULT_MAX_FRAME,
            dispatch_queue: DEFAULT_DISPATCH_QUEUE,
        }
    }
}

/// Lifecycle notifications for connections.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_connect(&self, _connection: Arc<Connection>) {}

    /// One framed inbound message. Calls arrive in order, one at a time.
    async fn on_message(&self, connection: Arc<Connection>, message: String);

    async fn on_disconnect(&self, _connection: Arc<Connection>) {}
}

/// Owns listeners and connections, keyed by socket path and generated id.
pub struct ConnectionManager {
    options: TransportOptions,
    connections: DashMap<String, Arc<Connection>>,
    listeners: DashMap<PathBuf, CancellationToken>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(options: TransportOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            connections: DashMap::new(),
            listeners: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind a Unix socket and accept connections in the background until
    /// [`stop_listening`](Self::stop_listening) or [`shutdown`](Self::shutdown).
    pub async fn listen(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        channel: &str,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ParleyResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Closed("connection manager".to_string()));
        }
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        // stale socket from a previous run
        let _ = tokio::fs::remove_file(&path).await;

        let listener = UnixListener::bind(&path).map_err(|e| {
            ParleyError::Transport(format!("binding to {}: {}", path.display(), e))
        })?;
        info!("Listening on {:?}", path);

        let token = self.shutdown.child_token();
        self.listeners.insert(path.clone(), token.clone());

        let manager = Arc::clone(self);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            debug!("New connection on {:?}", path);
                            manager.attach(stream, true, &channel, handler.clone());
                        }
                        Err(e) => error!("Accept error on {:?}: {}", path, e),
                    }
                }
            }

            manager.listeners.remove_if(&path, |_, t| t.is_cancelled());
            let _ = tokio::fs::remove_file(&path).await;
            info!("Stopped listening on {:?}", path);
        });
        Ok(())
    }

    /// Dial a Unix socket.
    pub async fn connect(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        channel: &str,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ParleyResult<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Closed("connection manager".to_string()));
        }
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            ParleyError::Transport(format!("connecting to {}: {}", path.display(), e))
        })?;
        Ok(self.attach(stream, false, channel, handler))
    }

    /// Register a stream and start its read loop.
    ///
    /// The loop frames inbound bytes and hands messages to a dispatcher task
    /// through a bounded queue; reading pauses while the queue is full. A
    /// peer sending an oversized message is dropped. When the peer closes or the
    /// connection is closed locally, pending messages are drained, the
    /// connection is deregistered and `on_disconnect` fires once.
    pub fn attach<S>(
        self: &Arc<Self>,
        stream: S,
        is_server: bool,
        channel: &str,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let connection = Arc::new(Connection::new(
            channel,
            is_server,
            &self.options.delimiter,
            Box::new(writer),
        ));
        self.connections
            .insert(connection.id().to_string(), connection.clone());

        let manager = Arc::clone(self);
        let conn = connection.clone();
        let read_size = self.options.read_buffer.max(1);
        let max_frame = self.options.max_frame;
        let queue = self.options.dispatch_queue.max(1);

        tokio::spawn(async move {
            handler.on_connect(conn.clone()).await;

            let (tx, mut rx) = mpsc::channel::<String>(queue);
            let dispatcher = {
                let handler = handler.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        handler.on_message(conn.clone(), message).await;
                    }
                })
            };

            let mut framer = MessageFramer::new(conn.delimiter()).with_max_frame(max_frame);
            let mut buf = vec![0u8; read_size];
            let cancel = conn.cancel_token();
            'read: loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => {
                            debug!("Connection {} closed by peer", conn.id());
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Read error on connection {}: {}", conn.id(), e);
                            break;
                        }
                    }
                };

                let messages = match framer.push(&buf[..n]) {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("Dropping connection {}: {}", conn.id(), e);
                        break;
                    }
                };
                for message in messages {
                    // a full queue pauses reading until the handler catches up
                    tokio::select! {
                        _ = cancel.cancelled() => break 'read,
                        sent = tx.send(message) => if sent.is_err() {
                            break 'read;
                        }
                    }
                }
            }

            if framer.buffered() > 0 {
                debug!(
                    "Dropping {} unterminated bytes on connection {}",
                    framer.buffered(),
                    conn.id()
                );
            }
            drop(tx);
            if let Err(e) = dispatcher.await {
                error!("Dispatcher for connection {} failed: {}", conn.id(), e);
            }

            conn.close().await;
            manager.connections.remove(conn.id());
            handler.on_disconnect(conn.clone()).await;
        });

        connection
    }

    /// Stop accepting on `path`. Established connections stay open.
    pub fn stop_listening(&self, path: impl AsRef<Path>) -> bool {
        match self.listeners.get(path.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Close one connection.
    pub async fn close(&self, id: &str) -> bool {
        match self.connections.remove(id) {
            Some((_, connection)) => connection.close().await,
            None => false,
        }
    }

    /// Stop every listener and close every connection. Safe to call twice.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            self.connections.remove(connection.id());
            connection.close().await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_listening(&self, path: impl AsRef<Path>) -> bool {
        self.listeners
            .get(path.as_ref())
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
