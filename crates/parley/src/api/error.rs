//! Error responses outside of a streamed exchange.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use parley_protocol::{EnvelopeContext, TransformerKind};
use tracing::{debug, error, warn};

use crate::error::ParleyError;

/// Respond with `err` as an error envelope encoded by `kind`, using the
/// error's status.
pub fn error_response(err: ParleyError, kind: TransformerKind) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match status.as_u16() {
        500..=599 => error!(key = %err.key(), message = %err, "API error"),
        410 => warn!(key = %err.key(), message = %err, "Client went away"),
        _ => debug!(key = %err.key(), message = %err, "Client error"),
    }

    let encoder = kind.build();
    let mut body = BytesMut::new();
    match encoder.transform(&EnvelopeContext::default(), &mut body, &err.to_message()) {
        Ok(_) => (
            status,
            [(header::CONTENT_TYPE, encoder.content_type_header())],
            body.freeze(),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode error envelope: {}", e);
            status.into_response()
        }
    }
}

/// JSON error envelope, for callers that have no `Accept` header to go by.
impl IntoResponse for ParleyError {
    fn into_response(self) -> Response {
        error_response(self, TransformerKind::Json)
    }
}
