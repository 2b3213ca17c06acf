//! HTTP request handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use parley_protocol::{Envelope, OutMessage, ProtocolError};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::error::error_response;
use super::state::{AppState, Exchange};
use crate::ask::{Handled, PrivateKeyExport};
use crate::context::{RequestContext, ResponseProperties};
use crate::error::{ParleyError, ParleyResult};
use crate::sink::{HttpSink, Sink};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Query options accepted by every streaming endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Attach a debug object to every envelope.
    pub debug: bool,
    /// Default target for messages that name none.
    pub target: Option<String>,
    /// Comma-separated default actions.
    pub actions: Option<String>,
}

impl RequestOptions {
    fn context(&self, uri: &Uri) -> RequestContext {
        let actions = self.actions.as_ref().map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        });
        RequestContext::new()
            .with_path(uri.path())
            .with_debug(self.debug)
            .with_response(ResponseProperties {
                target: self.target.clone(),
                actions,
            })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExportRequest {
    pub namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallbackRequest {
    pub answers: Vec<Value>,
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ParleyResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::invalid_envelope(format!("request body: {e}")).into())
}

/// Write an unrecovered error into the response. Returns false once the
/// client is gone.
async fn report(exchange: &Exchange, err: ParleyError) -> bool {
    if matches!(
        err,
        ParleyError::Disconnected { .. } | ParleyError::Closed(_) | ParleyError::Cancelled
    ) {
        debug!(sink = %exchange.sink.id(), "stopping exchange: {}", err);
        return false;
    }
    exchange
        .sink
        .send(err.to_message(), &exchange.cancel)
        .await
        .is_ok()
}

/// Write the terminal state of an ask chain.
async fn settle(exchange: &Exchange, (cont, outstanding): Handled) {
    match outstanding {
        None => {
            let text = if cont { "Completed" } else { "Stopped" };
            let message = OutMessage::text(text).with_meta("continue", json!(cont));
            if let Err(e) = exchange.router.send(message, &exchange.cancel).await {
                report(exchange, e).await;
            }
        }
        Some(ParleyError::Deferred { callback_id }) => {
            debug!(callback = %callback_id, "awaiting answer");
        }
        Some(err) => {
            report(exchange, err).await;
        }
    }
}

/// Send every posted envelope through the router, streaming the encoded
/// output back.
pub async fn post_messages(
    State(state): State<AppState>,
    Query(options): Query<RequestOptions>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = state.negotiate(&headers);
    let envelopes: Vec<Envelope> = match parse_body(&body) {
        Ok(envelopes) => envelopes,
        Err(e) => return error_response(e, kind),
    };

    let (exchange, pending) = state.exchange(options.context(&uri), kind);
    debug!(count = envelopes.len(), kind = ?kind, "posting messages");

    tokio::spawn(async move {
        for envelope in envelopes {
            let result = match OutMessage::try_from(envelope) {
                Ok(message) => exchange.router.send(message, &exchange.cancel).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result
                && !report(&exchange, e).await
            {
                break;
            }
        }
        exchange.sink.complete().await;
    });

    pending.into_response().await
}

/// Open a live connection for `identity`. The response stays open until the
/// connection is replaced or the server shuts down.
pub async fn open_live(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    headers: HeaderMap,
) -> Response {
    let kind = state.negotiate(&headers);
    info!(identity = %identity, kind = ?kind, "opening live connection");
    state.live.open(&identity, kind).await.into_response().await
}

/// Deliver one envelope to a live connection.
pub async fn post_live_message(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(options): Query<RequestOptions>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = state.negotiate(&headers);
    let message = match parse_body::<Option<Envelope>>(&body).and_then(|envelope| {
        let envelope =
            envelope.ok_or_else(|| ProtocolError::invalid_envelope("empty request body"))?;
        Ok(OutMessage::try_from(envelope)?)
    }) {
        Ok(message) => message,
        Err(e) => return error_response(e, kind),
    };

    let ctx = options.context(&uri).with_identity(identity.clone());
    let Some(sink) = HttpSink::for_live(state.live.clone(), ctx) else {
        let err = ParleyError::runtime(
            format!("no live connection for '{identity}'"),
            "NoLiveConnection",
            404,
        );
        return error_response(err, kind);
    };

    let exchange = state.exchange_over(Arc::new(sink));
    match exchange.router.send(message, &exchange.cancel).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e, kind),
    }
}

/// Start the private key export interrogation. The first question streams
/// back as an ask envelope whose callback names the resume path.
pub async fn start_private_key_export(
    State(state): State<AppState>,
    Query(options): Query<RequestOptions>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = state.negotiate(&headers);
    let request: ExportRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e, kind),
    };
    let namespace = request.namespace.unwrap_or_else(|| "default".to_string());

    let (exchange, pending) = state.exchange(options.context(&uri), kind);
    let export = PrivateKeyExport::new(state.classifier.clone(), state.settings.clone(), namespace);

    tokio::spawn(async move {
        match export.authorize().await {
            Ok(decision) => {
                let message = OutMessage::text(decision.explain)
                    .with_meta("level", json!(decision.level))
                    .with_meta("expires", json!(decision.expires));
                if let Err(e) = exchange.router.send(message, &exchange.cancel).await {
                    report(&exchange, e).await;
                }
            }
            Err(err) => {
                let handled = exchange.handler.handle(err, &exchange.cancel).await;
                settle(&exchange, handled).await;
            }
        }
        exchange.sink.complete().await;
    });

    pending.into_response().await
}

/// Answer a parked question and continue its chain.
pub async fn post_callback(
    State(state): State<AppState>,
    Path(callback_id): Path<String>,
    Query(options): Query<RequestOptions>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = state.negotiate(&headers);
    let request: CallbackRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e, kind),
    };

    let (exchange, pending) = state.exchange(options.context(&uri), kind);

    tokio::spawn(async move {
        let handled = exchange
            .handler
            .resume(&callback_id, request.answers, &exchange.cancel)
            .await;
        settle(&exchange, handled).await;
        exchange.sink.complete().await;
    });

    pending.into_response().await
}
