//! TCP transport: accept loop, per-connection framing, send path

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionHandler, MessageExtractor, SendError};
pub use listener::{ConnectionRegistry, TcpEndpoint};
