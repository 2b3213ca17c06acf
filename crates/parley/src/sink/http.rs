//! HTTP response sink and the live connection registry.
//!
//! A [`ResponseChannel`] is the write side of one streamed HTTP response. Its
//! mutex is the write gate: it is held for one whole transform-and-enqueue, so
//! concurrent producers never interleave bytes. The first successful write
//! decides the status line and headers; the axum handler awaits that head via
//! [`PendingResponse::into_response`] and streams the body from a channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{
    AskMessage, EnvelopeContext, OutMessage, StreamTracker, Transformer, TransformerKind,
};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Sink;
use crate::context::RequestContext;
use crate::error::{ParleyError, ParleyResult};

/// Body chunks buffered per response before writers wait.
pub const DEFAULT_BODY_BUFFER: usize = 64;

// ============================================================================
// Response channel
// ============================================================================

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    content_type: String,
    no_cache: bool,
}

struct ChannelState {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<Bytes>>,
    streams: StreamTracker,
}

/// Write side of one streamed response.
pub struct ResponseChannel {
    id: String,
    transformer: Arc<dyn Transformer>,
    gate: Mutex<ChannelState>,
    flushed: AtomicBool,
}

/// Read side, turned into an axum response by the handler.
pub struct PendingResponse {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Bytes>,
    content_type: String,
}

impl ResponseChannel {
    pub fn new(kind: TransformerKind, buffer: usize) -> (Arc<Self>, PendingResponse) {
        let transformer = kind.build();
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(buffer.max(1));

        let pending = PendingResponse {
            head: head_rx,
            body: body_rx,
            content_type: transformer.content_type_header(),
        };
        let channel = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            transformer,
            gate: Mutex::new(ChannelState {
                head: Some(head_tx),
                body: Some(body_tx),
                streams: StreamTracker::new(),
            }),
            flushed: AtomicBool::new(false),
        });
        (channel, pending)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transformer_kind(&self) -> TransformerKind {
        self.transformer.kind()
    }

    /// Whether the response head has been sent.
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> MutexGuard<'_, ChannelState> {
        if let Ok(guard) = self.gate.try_lock() {
            return guard;
        }
        let started = Instant::now();
        let guard = self.gate.lock().await;
        debug!(
            channel = %self.id,
            waited_ms = started.elapsed().as_millis() as u64,
            "waited for response write gate"
        );
        guard
    }

    fn send_head(&self, state: &mut ChannelState, status: u16) {
        if let Some(tx) = state.head.take() {
            let head = ResponseHead {
                status,
                content_type: self.transformer.content_type_header(),
                no_cache: self.transformer.kind() == TransformerKind::Plang,
            };
            // a dropped receiver surfaces on the body send
            let _ = tx.send(head);
            self.flushed.store(true, Ordering::SeqCst);
        }
    }

    /// Encode and enqueue one message. Returns the bytes written; zero after
    /// [`complete`](Self::complete). The head goes out with the first
    /// non-empty write.
    pub async fn write(&self, ctx: &EnvelopeContext, message: &OutMessage) -> ParleyResult<usize> {
        let mut guard = self.acquire().await;
        let state = &mut *guard;

        let Some(body) = state.body.clone() else {
            return Ok(0);
        };
        if body.is_closed() {
            return Err(ParleyError::disconnected(&self.id));
        }
        if let OutMessage::Stream(stream) = message {
            state.streams.observe(stream)?;
        }

        let mut buf = BytesMut::new();
        let written = self.transformer.transform(ctx, &mut buf, message)?;

        if written == 0 {
            return Ok(0);
        }
        self.send_head(state, message.status_code());
        body.send(buf.freeze())
            .await
            .map_err(|_| ParleyError::disconnected(&self.id))?;
        Ok(written)
    }

    /// Send the head without a body chunk.
    pub async fn flush_head(&self, status: u16) {
        let mut state = self.acquire().await;
        self.send_head(&mut state, status);
    }

    /// Finish the response. Later writes are no-ops.
    pub async fn complete(&self) {
        let mut state = self.acquire().await;
        self.send_head(&mut state, 200);
        state.body = None;
        let open = state.streams.open_streams();
        if !open.is_empty() {
            warn!(channel = %self.id, streams = ?open, "response completed with open streams");
        }
    }

    pub async fn is_completed(&self) -> bool {
        self.gate.lock().await.body.is_none()
    }
}

impl PendingResponse {
    /// Wait for the head, then stream the body.
    pub async fn into_response(self) -> Response {
        let head = self.head.await.unwrap_or(ResponseHead {
            status: 200,
            content_type: self.content_type,
            no_cache: false,
        });

        let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK);
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, head.content_type);
        if head.no_cache {
            builder = builder
                .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(header::PRAGMA, "no-cache")
                .header(header::EXPIRES, "0")
                .header("X-Accel-Buffering", "no");
        }

        let stream = ReceiverStream::new(self.body).map(Ok::<_, Infallible>);
        builder.body(Body::from_stream(stream)).unwrap_or_else(|e| {
            error!("Failed to build streamed response: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
    }
}

// ============================================================================
// Live connections
// ============================================================================

/// A response kept open across sends, registered under an identity.
pub struct LiveConnection {
    pub identity: String,
    pub channel: Arc<ResponseChannel>,
    pub opened_at: DateTime<Utc>,
}

/// Registry of live connections keyed by identity.
pub struct LiveConnections {
    connections: DashMap<String, Arc<LiveConnection>>,
    buffer: usize,
}

impl LiveConnections {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            buffer,
        }
    }

    /// Open a live connection. The head is written immediately and any previous
    /// connection under the same identity is completed and replaced.
    pub async fn open(&self, identity: &str, kind: TransformerKind) -> PendingResponse {
        let (channel, pending) = ResponseChannel::new(kind, self.buffer);
        channel.flush_head(200).await;

        let connection = Arc::new(LiveConnection {
            identity: identity.to_string(),
            channel,
            opened_at: Utc::now(),
        });
        if let Some(previous) = self.connections.insert(identity.to_string(), connection) {
            info!(identity = %identity, "replacing live connection");
            previous.channel.complete().await;
        }
        pending
    }

    pub fn get(&self, identity: &str) -> Option<Arc<LiveConnection>> {
        self.connections.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove `identity` if it still points at `channel_id`.
    pub fn remove(&self, identity: &str, channel_id: &str) -> bool {
        self.connections
            .remove_if(identity, |_, conn| conn.channel.id() == channel_id)
            .is_some()
    }

    /// Complete and forget every live connection.
    pub async fn complete_all(&self) {
        let connections: Vec<Arc<LiveConnection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for connection in connections {
            connection.channel.complete().await;
        }
    }

    pub fn identities(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for LiveConnections {
    fn default() -> Self {
        Self::new(DEFAULT_BODY_BUFFER)
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Sink over one HTTP response or one live connection.
///
/// Asks are written like any other message and return `None`: the answer
/// comes back through a separate request correlated by callback id.
pub struct HttpSink {
    id: String,
    channel: Arc<ResponseChannel>,
    ctx: RequestContext,
    live: Option<Arc<LiveConnections>>,
}

impl HttpSink {
    /// Sink for a fresh response.
    pub fn new(ctx: RequestContext, kind: TransformerKind, buffer: usize) -> (Self, PendingResponse) {
        let (channel, pending) = ResponseChannel::new(kind, buffer);
        let sink = Self {
            id: format!("http:{}", ctx.id),
            channel,
            ctx,
            live: None,
        };
        (sink, pending)
    }

    /// Sink for the live connection registered under the context's identity.
    pub fn for_live(registry: Arc<LiveConnections>, ctx: RequestContext) -> Option<Self> {
        let identity = ctx.identity.clone()?;
        let connection = registry.get(&identity)?;
        Some(Self {
            id: format!("live:{identity}"),
            channel: connection.channel.clone(),
            ctx,
            live: Some(registry),
        })
    }

    pub fn transformer_kind(&self) -> TransformerKind {
        self.channel.transformer_kind()
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub async fn complete(&self) {
        self.channel.complete().await;
    }

    fn forget_live(&self) {
        if let (Some(registry), Some(identity)) = (&self.live, &self.ctx.identity)
            && registry.remove(identity, self.channel.id())
        {
            info!(identity = %identity, "live connection went away, unregistered");
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stateful(&self) -> bool {
        self.live.is_some()
    }

    async fn send(&self, mut message: OutMessage, cancel: &CancellationToken) -> ParleyResult<()> {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }
        self.ctx.apply_response_properties(&mut message);

        let envelope_ctx = self.ctx.envelope_context();
        let write = self.channel.write(&envelope_ctx, &message);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ParleyError::Cancelled),
            result = write => result,
        };

        match result {
            Ok(_) => Ok(()),
            Err(ParleyError::Disconnected { .. }) => {
                self.forget_live();
                Err(ParleyError::disconnected(&self.id))
            }
            Err(err) => Err(err),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{Envelope, StreamMessage};

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_first_write_sets_head() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Plang, 8);
        let cancel = CancellationToken::new();
        sink.send(OutMessage::error("nope", "Denied").with_status(403), &cancel)
            .await
            .unwrap();
        sink.send(OutMessage::text("after"), &cancel).await.unwrap();
        sink.complete().await;

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let headers = response.headers();
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/x-ndjson; charset=utf-8"
        );
        assert_eq!(headers["X-Accel-Buffering"], "no");
        assert!(headers[header::CACHE_CONTROL].to_str().unwrap().contains("no-cache"));

        let body = body_of(response).await;
        let lines: Vec<Envelope> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].key.as_deref(), Some("Denied"));
        assert_eq!(lines[1].content.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_empty_write_leaves_head_open() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Text, 8);
        let cancel = CancellationToken::new();
        sink.send(StreamMessage::start("s1", "text/plain").into(), &cancel)
            .await
            .unwrap();
        assert!(!sink.channel.is_flushed());

        sink.send(OutMessage::error("missing", "NotFound").with_status(404), &cancel)
            .await
            .unwrap();
        assert!(sink.channel.is_flushed());
        sink.send(StreamMessage::end("s1").into(), &cancel)
            .await
            .unwrap();
        sink.complete().await;

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await, "missing");
    }

    #[tokio::test]
    async fn test_json_has_no_cache_headers() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Json, 8);
        sink.send(OutMessage::text("x"), &CancellationToken::new())
            .await
            .unwrap();
        sink.complete().await;
        let response = pending.into_response().await;
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_send_after_complete_is_noop() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Text, 8);
        let cancel = CancellationToken::new();
        sink.send(OutMessage::text("one"), &cancel).await.unwrap();
        sink.complete().await;
        sink.send(OutMessage::text("two"), &cancel).await.unwrap();
        assert_eq!(body_of(pending.into_response().await).await, "one");
    }

    #[tokio::test]
    async fn test_complete_without_writes_is_empty_ok() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Text, 8);
        sink.complete().await;
        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "");
    }

    #[tokio::test]
    async fn test_stream_order_is_enforced() {
        let (sink, _pending) = HttpSink::new(RequestContext::new(), TransformerKind::Plang, 8);
        let cancel = CancellationToken::new();
        let err = sink
            .send(StreamMessage::text_chunk("s1", "early").into(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "StreamOrder");

        sink.send(StreamMessage::start("s1", "text/plain").into(), &cancel)
            .await
            .unwrap();
        sink.send(StreamMessage::text_chunk("s1", "ok").into(), &cancel)
            .await
            .unwrap();
        sink.send(StreamMessage::end("s1").into(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ask_is_half_duplex() {
        let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Json, 8);
        let answer = sink
            .ask(AskMessage::new("Continue?"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(answer.is_none());
        sink.complete().await;
        let body = body_of(pending.into_response().await).await;
        assert!(body.contains("\"kind\":\"ask\""));
    }

    #[tokio::test]
    async fn test_live_connection_lifecycle() {
        let registry = Arc::new(LiveConnections::new(8));
        let pending = registry.open("alice", TransformerKind::Plang).await;
        let live = registry.get("alice").unwrap();
        assert!(live.channel.is_flushed());

        let ctx = RequestContext::new().with_identity("alice");
        let sink = HttpSink::for_live(registry.clone(), ctx.clone()).unwrap();
        assert!(sink.is_stateful());
        sink.send(OutMessage::text("hello"), &CancellationToken::new())
            .await
            .unwrap();

        // client goes away
        drop(pending);
        let err = sink
            .send(OutMessage::text("anyone?"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Disconnected { .. }));
        assert!(registry.get("alice").is_none());
        assert!(HttpSink::for_live(registry, ctx).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_live_sends_do_not_interleave() {
        let registry = Arc::new(LiveConnections::new(4));
        let response = registry
            .open("carol", TransformerKind::Json)
            .await
            .into_response()
            .await;
        let reader = tokio::spawn(body_of(response));

        let mut tasks = Vec::new();
        for i in 0..12 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = RequestContext::new().with_identity("carol");
                let sink = HttpSink::for_live(registry, ctx).unwrap();
                let content = format!("{i}:{}", "y".repeat(4096));
                sink.send(OutMessage::text(content), &CancellationToken::new())
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        registry.complete_all().await;

        let body = reader.await.unwrap();
        let mut seen: Vec<usize> = body
            .lines()
            .map(|line| {
                let envelope: Envelope = serde_json::from_str(line).unwrap();
                let content = envelope.content.unwrap();
                let (index, rest) = content.split_once(':').unwrap();
                assert_eq!(rest, "y".repeat(4096));
                index.parse().unwrap()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_live_open_replaces_previous() {
        let registry = LiveConnections::new(8);
        let _first = registry.open("bob", TransformerKind::Text).await;
        let first_channel = registry.get("bob").unwrap().channel.clone();
        let _second = registry.open("bob", TransformerKind::Text).await;

        assert_eq!(registry.len(), 1);
        assert!(first_channel.is_completed().await);
        assert!(!registry.remove("bob", first_channel.id()));
        assert_eq!(registry.identities(), vec!["bob".to_string()]);
    }
}
