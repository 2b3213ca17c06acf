//! Byte-stream transport connections over Unix domain sockets.
//!
//! Messages are separated by a configurable delimiter (newline by default)
//! with no length prefix. Listening and connecting sides are symmetric except
//! for the actor their connections are labeled with.

mod connection;
mod framing;
mod manager;

pub use connection::Connection;
pub use framing::{DEFAULT_DELIMITER, DEFAULT_MAX_FRAME, MessageFramer};
pub use manager::{
    ConnectionHandler, ConnectionManager, DEFAULT_DISPATCH_QUEUE, TransportOptions,
};
