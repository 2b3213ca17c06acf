//! Transport integration tests over Unix sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley::ParleyError;
use parley::protocol::{Actor, OutMessage};
use parley::router::SinkRouter;
use parley::sink::{ConnectionSink, MemorySink, PipeBridge, Sink};
use parley::transport::{Connection, ConnectionHandler, ConnectionManager, TransportOptions};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    disconnected: Mutex<Vec<String>>,
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn on_connect(&self, connection: Arc<Connection>) {
        self.connections.lock().await.push(connection);
    }

    async fn on_message(&self, _connection: Arc<Connection>, message: String) {
        self.messages.lock().await.push(message);
    }

    async fn on_disconnect(&self, connection: Arc<Connection>) {
        self.disconnected
            .lock()
            .await
            .push(connection.id().to_string());
    }
}

impl Recorder {
    async fn wait_for_messages(&self, count: usize) -> Vec<String> {
        for _ in 0..400 {
            let messages = self.messages.lock().await.clone();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} messages");
    }

    async fn wait_for_connection(&self) -> Arc<Connection> {
        for _ in 0..400 {
            if let Some(connection) = self.connections.lock().await.first() {
                return connection.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no connection accepted");
    }

    async fn wait_for_disconnect(&self) -> Vec<String> {
        for _ in 0..400 {
            let disconnected = self.disconnected.lock().await.clone();
            if !disconnected.is_empty() {
                return disconnected;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no disconnect observed");
    }
}

#[tokio::test]
async fn test_messages_reassembled_across_writes() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("parley.sock");
    let manager = ConnectionManager::new(TransportOptions::default());
    let recorder = Arc::new(Recorder::default());
    manager
        .listen(&socket, "pipe", recorder.clone())
        .await
        .unwrap();
    assert!(manager.is_listening(&socket));

    let mut client = UnixStream::connect(&socket).await.unwrap();
    for part in [&b"abc"[..], b"def\n", b"ghi\n"] {
        client.write_all(part).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // a multi-byte character split across two writes
    let word = "héllo\n".as_bytes();
    client.write_all(&word[..2]).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.write_all(&word[2..]).await.unwrap();

    // whitespace-only segments are skipped
    client.write_all(b"  \n").await.unwrap();
    client.write_all(b"last\n").await.unwrap();

    let messages = recorder.wait_for_messages(4).await;
    assert_eq!(messages, vec!["abcdef", "ghi", "héllo", "last"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_server_sends_envelopes_with_delimiter() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("out.sock");
    let manager = ConnectionManager::new(TransportOptions::default());
    let recorder = Arc::new(Recorder::default());
    manager
        .listen(&socket, "pipe", recorder.clone())
        .await
        .unwrap();

    let client = UnixStream::connect(&socket).await.unwrap();
    let connection = recorder.wait_for_connection().await;
    assert_eq!(connection.actor(), Actor::User);

    connection
        .send(&OutMessage::text("from server"))
        .await
        .unwrap();

    let mut lines = BufReader::new(client).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope["kind"], "text");
    assert_eq!(envelope["content"], "from server");

    assert!(connection.close().await);
    assert!(!connection.close().await);
    assert!(connection.send(&OutMessage::text("late")).await.is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_bridge_between_listener_and_client() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("bridge.sock");

    let inbound = Arc::new(MemorySink::new("inbound"));
    let router = Arc::new(
        SinkRouter::builder()
            .user(Arc::new(MemorySink::new("user")))
            .system(Arc::new(MemorySink::new("system")))
            .build(),
    );
    let bridge = Arc::new(PipeBridge::new(router.clone(), inbound.clone()));

    let server = ConnectionManager::new(TransportOptions::default());
    server.listen(&socket, "pipe", bridge).await.unwrap();

    let client = ConnectionManager::new(TransportOptions::default());
    let client_recorder = Arc::new(Recorder::default());
    let connection = client
        .connect(&socket, "pipe", client_recorder.clone())
        .await
        .unwrap();
    assert_eq!(connection.actor(), Actor::Service);

    connection
        .send(&OutMessage::text("hello server").with_channel("pipe"))
        .await
        .unwrap();
    connection.send_text("plain").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..400 {
        received = inbound.messages().await;
        if received.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(received.len(), 2);
    // stamped with the server-side connection's actor
    assert_eq!(received[0].actor(), Actor::User);
    assert_eq!(received[1].channel(), "pipe");

    // messages on the connection's channel go back over the socket
    router
        .send(
            OutMessage::text("reply").with_channel("pipe"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let replies = client_recorder.wait_for_messages(1).await;
    let envelope: serde_json::Value = serde_json::from_str(&replies[0]).unwrap();
    assert_eq!(envelope["content"], "reply");

    client.shutdown().await;
    for _ in 0..400 {
        if router.channel_names().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(router.channel_names().is_empty());

    server.stop_listening(&socket);
    server.shutdown().await;
    server.shutdown().await;
    assert!(server.is_empty());
}

#[tokio::test]
async fn test_cancel_never_splits_a_frame() {
    let manager = ConnectionManager::new(TransportOptions::default());
    let (local, remote) = tokio::io::duplex(64);
    let connection = manager.attach(local, true, "pipe", Arc::new(Recorder::default()));
    let sink = Arc::new(ConnectionSink::new(connection.clone()));

    // the peer is not reading yet, so this frame stalls after 64 bytes
    let first_cancel = CancellationToken::new();
    let first = {
        let sink = sink.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move {
            sink.send(OutMessage::text("x".repeat(4096)), &cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a writer still waiting for the connection gives up cleanly
    let queued_cancel = CancellationToken::new();
    let queued = {
        let sink = sink.clone();
        let cancel = queued_cancel.clone();
        tokio::spawn(async move { sink.send(OutMessage::text("queued"), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queued_cancel.cancel();
    assert!(matches!(queued.await.unwrap(), Err(ParleyError::Cancelled)));

    // cancelling mid-frame lets the frame finish
    first_cancel.cancel();
    let mut lines = BufReader::new(remote).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope["content"].as_str().unwrap().len(), 4096);
    first.await.unwrap().unwrap();

    sink.send(OutMessage::text("second"), &CancellationToken::new())
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope["content"], "second");
    assert!(!connection.is_closed());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_write_failure_disconnects() {
    let (local, peer) = std::os::unix::net::UnixStream::pair().unwrap();
    // the peer stays open but refuses to read, so writes fail with EPIPE
    peer.shutdown(std::net::Shutdown::Read).unwrap();
    local.set_nonblocking(true).unwrap();
    let local = UnixStream::from_std(local).unwrap();

    let manager = ConnectionManager::new(TransportOptions::default());
    let recorder = Arc::new(Recorder::default());
    let connection = manager.attach(local, true, "pipe", recorder.clone());
    let id = connection.id().to_string();
    assert!(manager.get(&id).is_some());

    let sink = ConnectionSink::new(connection.clone());
    let err = sink
        .send(OutMessage::text("nobody reads this"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Disconnected { .. }));
    assert!(connection.is_closed());

    assert_eq!(recorder.wait_for_disconnect().await, vec![id.clone()]);
    assert!(manager.get(&id).is_none());
    assert!(manager.is_empty());
    drop(peer);
}

#[tokio::test]
async fn test_oversized_message_drops_connection() {
    let options = TransportOptions {
        max_frame: 16,
        ..TransportOptions::default()
    };
    let manager = ConnectionManager::new(options);
    let recorder = Arc::new(Recorder::default());
    let (local, mut remote) = tokio::io::duplex(1024);
    let connection = manager.attach(local, true, "pipe", recorder.clone());

    remote.write_all(b"fits\n").await.unwrap();
    assert_eq!(recorder.wait_for_messages(1).await, vec!["fits"]);

    remote.write_all(&[b'a'; 64]).await.unwrap();
    assert_eq!(
        recorder.wait_for_disconnect().await,
        vec![connection.id().to_string()]
    );
    assert!(manager.is_empty());
}
