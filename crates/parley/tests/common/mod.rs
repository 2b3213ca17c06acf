//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, header};
use parley::api::{self, AppState};
use parley::ask::KeywordClassifier;
use parley::settings::MemorySettingsStore;
use serde_json::Value;
use tower::ServiceExt;

/// State backed by in-memory settings and the keyword classifier.
pub fn test_state() -> AppState {
    AppState::new(
        Arc::new(MemorySettingsStore::new()),
        Arc::new(KeywordClassifier::default()),
    )
}

/// Create a test application with all services initialized.
pub async fn test_app() -> Router {
    api::create_router(test_state())
}

/// POST `body` with the given `Accept` header.
pub async fn post(app: &Router, uri: &str, accept: &str, body: Value) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT, accept)
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

/// Parse a newline-delimited JSON body.
pub async fn body_envelopes(response: Response<Body>) -> Vec<Value> {
    body_string(response)
        .await
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
