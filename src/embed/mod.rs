//! Embedding API.
//!
//! Hosts that link the library, directly or through [`ffi`], never hold a
//! `StorageEngine` or `Server` themselves. Instances live in process-wide
//! arenas and are referred to by opaque [`Handle`]s. Store and server handles
//! come from one counter, so a handle never names two things, and `0` is
//! never issued.
//!
//! ```no_run
//! use pocketkv::embed;
//!
//! let store = embed::store_new();
//! let server = embed::server_new(store, 6380).unwrap();
//! embed::server_start(server).unwrap();
//!
//! embed::store_set(store, b"greeting", b"hello");
//! // redis-cli -p 6380 GET greeting  =>  "hello"
//!
//! embed::server_stop(server).unwrap();
//! embed::server_free(server);
//! embed::store_free(store);
//! ```
//!
//! A server keeps its store alive; freeing the store handle while a server
//! still uses it only drops the handle.

pub mod ffi;

use crate::server::{Server, ServerConfig, ServerError};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::EnvFilter;

/// Port used by [`server_new_default`], the same as Redis.
pub const DEFAULT_PORT: u16 = 6379;

/// Opaque reference to a store or server owned by the embedding arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Never refers to anything.
    pub const NULL: Handle = Handle(0);

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    #[error(transparent)]
    Server(#[from] ServerError),
}

type SharedServer = Arc<Mutex<Server>>;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

static STORES: LazyLock<Mutex<HashMap<Handle, Arc<StorageEngine>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static SERVERS: LazyLock<Mutex<HashMap<Handle, SharedServer>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A panic while a lock was held cannot leave these maps half-updated, so a
/// poisoned lock is still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_handle() -> Handle {
    Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

fn store(handle: Handle) -> Option<Arc<StorageEngine>> {
    lock(&STORES).get(&handle).cloned()
}

fn server(handle: Handle) -> Result<SharedServer, EmbedError> {
    lock(&SERVERS)
        .get(&handle)
        .cloned()
        .ok_or(EmbedError::UnknownHandle(handle.0))
}

// ============================================================================
// Stores
// ============================================================================

pub fn store_new() -> Handle {
    let handle = next_handle();
    lock(&STORES).insert(handle, Arc::new(StorageEngine::new()));
    handle
}

/// Releases the handle. Returns `false` if it was unknown.
pub fn store_free(handle: Handle) -> bool {
    lock(&STORES).remove(&handle).is_some()
}

pub fn store_get(handle: Handle, key: &[u8]) -> Option<Bytes> {
    store(handle)?.get(key)
}

/// Stores `value` under `key`, clearing any expiry. Returns `false` only for
/// an unknown handle.
pub fn store_set(handle: Handle, key: &[u8], value: &[u8]) -> bool {
    match store(handle) {
        Some(engine) => {
            engine.set(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
            true
        }
        None => false,
    }
}

/// Returns `true` if the key existed and was removed.
pub fn store_del(handle: Handle, key: &[u8]) -> bool {
    store(handle).is_some_and(|engine| engine.delete(key))
}

// ============================================================================
// Servers
// ============================================================================

/// Creates an idle server for `store` on `port`. `None` if the store handle
/// is unknown.
pub fn server_new(store_handle: Handle, port: u16) -> Option<Handle> {
    server_new_with_config(store_handle, ServerConfig::new(port))
}

/// [`server_new`] on [`DEFAULT_PORT`].
pub fn server_new_default(store_handle: Handle) -> Option<Handle> {
    server_new(store_handle, DEFAULT_PORT)
}

pub fn server_new_with_config(store_handle: Handle, config: ServerConfig) -> Option<Handle> {
    let engine = store(store_handle)?;
    let handle = next_handle();
    lock(&SERVERS).insert(handle, Arc::new(Mutex::new(Server::new(engine, config))));
    Some(handle)
}

/// Starts the server and returns the address it listens on.
pub fn server_start(handle: Handle) -> Result<SocketAddr, EmbedError> {
    let server = server(handle)?;
    let addr = lock(&server).start()?;
    Ok(addr)
}

/// Stops the server. Blocks until its port is released.
pub fn server_stop(handle: Handle) -> Result<(), EmbedError> {
    let server = server(handle)?;
    lock(&server).stop()?;
    Ok(())
}

/// Address of a running server.
pub fn server_local_addr(handle: Handle) -> Option<SocketAddr> {
    let server = server(handle).ok()?;
    let addr = lock(&server).local_addr();
    addr
}

/// Releases the handle, stopping the server first if it is running. Returns
/// `false` if the handle was unknown.
pub fn server_free(handle: Handle) -> bool {
    let Some(server) = lock(&SERVERS).remove(&handle) else {
        return false;
    };

    let mut guard = lock(&server);
    if guard.is_running() {
        let _ = guard.stop();
    }
    true
}

/// Installs a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// (default `info`). Returns `false` if a global subscriber already exists.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
