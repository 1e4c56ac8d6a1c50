//! Messaging layer.
//!
//! One full-duplex TCP connection per peer, request/response correlation,
//! per-kind routing and bounded queues on both directions.

mod connection;
mod peer;
mod pending;
mod router;
mod server;
mod table;

pub use connection::{Connection, HandlerPool};
pub use peer::Peer;
pub use pending::{Completion, PendingRequests};
pub use router::{MessageHandler, Router};
pub use server::Server;
pub use table::ConnectionTable;
