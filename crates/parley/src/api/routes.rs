//! Route table.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/messages", post(handlers::post_messages))
        .route("/live/{identity}", get(handlers::open_live))
        .route(
            "/live/{identity}/messages",
            post(handlers::post_live_message),
        )
        .route(
            "/ask/private-key-export",
            post(handlers::start_private_key_export),
        )
        .route("/callback/{callback_id}", post(handlers::post_callback))
        .layer(trace_layer)
        .with_state(state)
}
