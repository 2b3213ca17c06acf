//! HTTP API module.
//!
//! Every streaming endpoint gets its own [`HttpSink`](crate::sink::HttpSink)
//! and router. Questions are deferred: the ask envelope names a callback path
//! and the continuation waits in the shared pending registry until the answer
//! is posted there.

mod error;
mod handlers;
mod routes;
mod state;

pub use handlers::{CallbackRequest, ExportRequest, HealthResponse, RequestOptions};
pub use routes::create_router;
pub use state::{AppState, CALLBACK_BASE, Exchange};
