//! Interactive output and recoverable-error protocol.
//!
//! Producers emit [`OutMessage`](parley_protocol::OutMessage)s; the
//! [`SinkRouter`](router::SinkRouter) picks a sink by actor, channel, kind and
//! level; sinks encode with a negotiated transformer. Errors that can be fixed
//! by asking the user carry their own continuation and are driven to
//! completion by [`BaseErrorHandler`](ask::BaseErrorHandler).

pub mod api;
pub mod ask;
pub mod config;
pub mod context;
pub mod error;
pub mod router;
pub mod settings;
pub mod sink;
pub mod transport;

pub use error::{ParleyError, ParleyResult};
pub use parley_protocol as protocol;
