//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use parley_protocol::TransformerKind;
use tokio_util::sync::CancellationToken;

use crate::ask::{BaseErrorHandler, DecisionClassifier, PendingAsks, RunMode, SinkAskHandler};
use crate::context::RequestContext;
use crate::router::{MessageType, SinkRouter};
use crate::settings::SettingsStore;
use crate::sink::{DEFAULT_BODY_BUFFER, HttpSink, LiveConnections, PendingResponse, Sink, TracingSink};

/// Path prefix under which answers to deferred questions are posted.
pub const CALLBACK_BASE: &str = "/callback";

#[derive(Clone)]
pub struct AppState {
    pub live: Arc<LiveConnections>,
    pub pending: Arc<PendingAsks>,
    pub settings: Arc<dyn SettingsStore>,
    pub classifier: Arc<dyn DecisionClassifier>,
    pub default_kind: TransformerKind,
    pub buffer: usize,
    pub max_turns: Option<usize>,
    /// Cancelled on shutdown; each request works under a child token.
    pub shutdown: CancellationToken,
    tracing: Arc<TracingSink>,
}

impl AppState {
    pub fn new(settings: Arc<dyn SettingsStore>, classifier: Arc<dyn DecisionClassifier>) -> Self {
        Self {
            live: Arc::new(LiveConnections::new(DEFAULT_BODY_BUFFER)),
            pending: Arc::new(PendingAsks::new()),
            settings,
            classifier,
            default_kind: TransformerKind::Text,
            buffer: DEFAULT_BODY_BUFFER,
            max_turns: None,
            shutdown: CancellationToken::new(),
            tracing: Arc::new(TracingSink::new()),
        }
    }

    pub fn with_default_kind(mut self, kind: TransformerKind) -> Self {
        self.default_kind = kind;
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self.live = Arc::new(LiveConnections::new(self.buffer));
        self
    }

    pub fn with_max_turns(mut self, max_turns: Option<usize>) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// How long a deferred question waits for its answer.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending = Arc::new(PendingAsks::with_ttl(ttl));
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Transformer for a request's `Accept` header.
    pub fn negotiate(&self, headers: &HeaderMap) -> TransformerKind {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok());
        TransformerKind::negotiate(accept, self.default_kind)
    }

    /// Routing for `sink`: user and system output go to the response, while
    /// log, audit, metric and debug traffic goes to the tracing subscriber.
    pub fn router_for(&self, sink: Arc<dyn Sink>) -> Arc<SinkRouter> {
        let tracing: Arc<dyn Sink> = self.tracing.clone();
        let mut builder = SinkRouter::builder().user(sink.clone()).system(sink);
        for message_type in [
            MessageType::SystemLog,
            MessageType::SystemAudit,
            MessageType::SystemMetrics,
            MessageType::SystemDebug,
            MessageType::SystemTrace,
        ] {
            builder = builder.route(message_type, tracing.clone());
        }
        Arc::new(builder.build())
    }

    /// A streamed response with its sink, router and error handler.
    pub fn exchange(&self, ctx: RequestContext, kind: TransformerKind) -> (Exchange, PendingResponse) {
        let (sink, pending) = HttpSink::new(ctx, kind, self.buffer);
        (self.exchange_over(Arc::new(sink)), pending)
    }

    /// Same as [`exchange`](Self::exchange) over an existing sink.
    pub fn exchange_over(&self, sink: Arc<HttpSink>) -> Exchange {
        let router = self.router_for(sink.clone());
        let asker = SinkAskHandler::new(router.clone()).with_callback_base(CALLBACK_BASE);
        let handler = BaseErrorHandler::new(Arc::new(asker), RunMode::Web)
            .with_max_turns(self.max_turns)
            .with_pending(self.pending.clone());
        Exchange {
            sink,
            router,
            handler,
            cancel: self.shutdown.child_token(),
        }
    }
}

/// Everything one request needs to write messages and resolve asks.
pub struct Exchange {
    pub sink: Arc<HttpSink>,
    pub router: Arc<SinkRouter>,
    pub handler: BaseErrorHandler,
    pub cancel: CancellationToken,
}
