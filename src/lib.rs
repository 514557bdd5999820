//! # PocketKV
//!
//! An embeddable, Redis-compatible key-value server. A host process creates a
//! store, puts a server in front of it and starts or stops that server with
//! blocking calls, while standard Redis clients talk to it over TCP.
//!
//! ## Architecture
//!
//! ```text
//!   host process                          Redis clients
//!        │                                      │
//!        ▼                                      ▼
//!  ┌───────────┐   start/stop   ┌──────────────────────────────┐
//!  │   embed   │──────────────► │ Server (own Tokio runtime)   │
//!  │ (handles, │                │   accept loop ─► connection  │
//!  │  C ABI)   │                │                  tasks       │
//!  └─────┬─────┘                └──────────────┬───────────────┘
//!        │ get/set/del                         │ decode_command
//!        │                                     ▼
//!        │                              CommandHandler
//!        │                                     │
//!        ▼                                     ▼
//!  ┌──────────────────────────────────────────────────────────┐
//!  │ StorageEngine: 64 RwLock shards, lazy + swept expiry     │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//!
//! `PING`, `GET`, `SET`, `GETSET`, `SETNX`, `SETEX`, `PSETEX`, `APPEND`,
//! `MSET`, `MSETNX`, `MGET`, `DEL`, `EXISTS`, `TYPE`, `INCR`, `DECR`,
//! `INCRBY`, `DECRBY`, `EXPIRE`, `PEXPIRE`, `TTL`, `PTTL`, `DBSIZE`, `INFO`
//! and `QUIT`. Values are byte strings; integer commands parse them on demand.
//!
//! ## Quick start
//!
//! ```no_run
//! use pocketkv::{Server, ServerConfig, StorageEngine};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let mut server = Server::new(Arc::clone(&storage), ServerConfig::new(6380));
//!
//! let addr = server.start()?;
//! println!("listening on {}", addr);
//!
//! // ... clients connect, the host reads and writes `storage` directly ...
//!
//! server.stop()?;
//! # Ok::<(), pocketkv::ServerError>(())
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: RESP values and incremental decoding
//! - [`storage`]: the concurrent store and its expiry sweeper
//! - [`commands`]: request dispatch
//! - [`connection`]: the per-client loop
//! - [`server`]: listener and runtime lifecycle
//! - [`embed`]: handle-based control surface and C ABI

pub mod commands;
pub mod connection;
pub mod embed;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::{ConnectionCounts, ConnectionStats};
pub use protocol::{decode_command, Frame, ParseError, RespValue};
pub use server::{Server, ServerConfig, ServerError, DEFAULT_HOST};
pub use storage::{ExpiryConfig, StorageEngine, StorageError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
