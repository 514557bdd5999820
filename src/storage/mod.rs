//! Storage engine.
//!
//! [`StorageEngine`] owns every entry and is the only code that touches the
//! underlying maps. Connections, the embedding API and the expiry sweeper all
//! go through its methods.
//!
//! ```
//! use pocketkv::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("name"), Bytes::from("Ariz"));
//! assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
//!
//! assert!(engine.expire(b"name", Duration::from_secs(60)));
//! assert_eq!(engine.ttl(b"name"), Some(60));
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{parse_i64, Entry, StorageEngine, StorageError, StorageStats};
pub use expiry::{ExpiryConfig, ExpirySweeper};
