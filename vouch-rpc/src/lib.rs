//! Vouch RPC
//!
//! The client-facing message surface of the trust graph kernel: typed
//! request/reply messages, the request handler, and the transport adapter
//! that delivers subscription notifications over a client connection.

pub mod handler;
pub mod messages;
pub mod transport;

pub use handler::RpcHandler;
pub use messages::{Message, Request};
pub use transport::{ReplySender, RpcTransport};
