//! Command layer.
//!
//! ```text
//! decoded request ──► CommandHandler::execute ──► StorageEngine
//!                              │
//!                              ▼
//!                          RespValue
//! ```
//!
//! The handler never sees raw bytes from the socket and never fails; every
//! problem with a request becomes an error reply.

pub mod handler;

pub use handler::{is_quit, CommandHandler};
