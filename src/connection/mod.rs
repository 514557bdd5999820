//! Client connections.
//!
//! The accept loop spawns one [`handle_connection`] task per client. Each
//! task owns its socket and read buffer; the only shared state is the
//! [`CommandHandler`](crate::commands::CommandHandler)'s storage engine, the
//! server-wide [`ConnectionStats`] and the shutdown signal.

pub mod handler;

pub use handler::{
    handle_connection, ConnectionCounts, ConnectionError, ConnectionHandler, ConnectionStats,
};
