//! TCP server lifecycle.
//!
//! A [`Server`] owns a dedicated multi-threaded Tokio runtime, so a host that
//! has no async machinery of its own can start and stop it with plain blocking
//! calls:
//!
//! ```text
//!            start()             stop()
//!   Idle ─────────────► Running ────────► Stopped
//!     ▲        │
//!     └────────┘
//!    bind failed
//! ```
//!
//! Stopping is terminal. `start` and `stop` block the calling thread but
//! never enter the caller's async context, so a host already running Tokio
//! may call them too (ideally from `spawn_blocking`).

use crate::commands::CommandHandler;
use crate::connection::{handle_connection, ConnectionCounts, ConnectionStats};
use crate::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::{self, Runtime};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Interface servers bind to unless configured otherwise.
pub const DEFAULT_HOST: &str = "127.0.0.1";

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long runtime shutdown waits for stray tasks once connections are gone.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,

    /// Port to listen on. `0` picks a free one; [`Server::start`] reports it.
    pub port: u16,

    /// Runtime worker threads. `None` uses Tokio's default (one per core).
    pub worker_threads: Option<usize>,

    /// How long `stop` lets open connections finish before aborting them.
    pub shutdown_grace: Duration,

    /// Background expiry sweeper settings; `None` relies on lazy eviction only.
    pub expiry: Option<ExpiryConfig>,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            worker_threads: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            expiry: Some(ExpiryConfig::default()),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_expiry(mut self, expiry: Option<ExpiryConfig>) -> Self {
        self.expiry = expiry;
        self
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("server has been stopped and cannot be restarted")]
    Terminated,
}

/// Everything that only exists while the server is accepting clients.
struct Running {
    runtime: Runtime,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweeper: Option<ExpirySweeper>,
}

enum State {
    Idle,
    Running(Running),
    Stopped,
}

/// A RESP server over a shared [`StorageEngine`].
pub struct Server {
    storage: Arc<StorageEngine>,
    config: ServerConfig,
    stats: Arc<ConnectionStats>,
    state: State,
}

impl Server {
    pub fn new(storage: Arc<StorageEngine>, config: ServerConfig) -> Self {
        Self {
            storage,
            config,
            stats: Arc::new(ConnectionStats::new()),
            state: State::Idle,
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn connection_stats(&self) -> ConnectionCounts {
        self.stats.snapshot()
    }

    /// Binds the listener and starts serving. Returns once clients can
    /// connect.
    ///
    /// A bind failure leaves the server idle, so `start` may be retried.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        match self.state {
            State::Idle => {}
            State::Running(_) => return Err(ServerError::AlreadyRunning),
            State::Stopped => return Err(ServerError::Terminated),
        }

        // Bound before the runtime exists: a runtime dropped on an error path
        // from inside the caller's async context would panic.
        let addr = self.config.bind_addr();
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(addr.as_str()).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;

        let mut builder = runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("pocketkv-worker");
        if let Some(threads) = self.config.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build().map_err(ServerError::Runtime)?;

        let registered = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)
        };
        let listener = match registered {
            Ok(listener) => listener,
            Err(source) => {
                runtime.shutdown_background();
                return Err(bind_error(source));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = runtime.spawn(accept_loop(
            listener,
            CommandHandler::new(Arc::clone(&self.storage)),
            Arc::clone(&self.stats),
            shutdown_rx,
            self.config.shutdown_grace,
        ));

        let sweeper = self.config.expiry.clone().map(|expiry| {
            let _guard = runtime.enter();
            ExpirySweeper::start(Arc::clone(&self.storage), expiry)
        });

        info!(address = %local_addr, "Server listening");

        self.state = State::Running(Running {
            runtime,
            local_addr,
            shutdown_tx,
            accept_task,
            sweeper,
        });
        Ok(local_addr)
    }

    /// Stops accepting, lets open connections finish within the grace period
    /// and tears the runtime down. The port is free again when this returns.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let running = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(running) => running,
            other => {
                self.state = other;
                return Err(ServerError::NotRunning);
            }
        };

        info!(address = %running.local_addr, "Stopping server");

        let Running {
            runtime,
            shutdown_tx,
            accept_task,
            sweeper,
            ..
        } = running;

        shutdown_tx.send_replace(true);
        drop(sweeper);

        // Waiting happens on a thread of its own, outside any runtime the
        // caller may be running on.
        let mut runtime = Some(runtime);
        let slot = &mut runtime;
        let joined = thread::scope(|scope| {
            thread::Builder::new()
                .name("pocketkv-shutdown".to_string())
                .spawn_scoped(scope, move || {
                    if let Some(runtime) = slot.take() {
                        wait_and_shutdown(runtime, accept_task);
                    }
                })
                .map(|handle| handle.join())
        });

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Shutdown thread panicked"),
            Err(e) => error!(error = %e, "Failed to spawn shutdown thread"),
        }
        if let Some(runtime) = runtime.take() {
            runtime.shutdown_background();
        }

        info!("Server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let State::Running(running) = std::mem::replace(&mut self.state, State::Stopped) {
            debug!(address = %running.local_addr, "Server dropped while running");
            running.shutdown_tx.send_replace(true);
            drop(running.sweeper);
            running.runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn wait_and_shutdown(runtime: Runtime, accept_task: JoinHandle<()>) {
    if let Err(e) = runtime.block_on(accept_task) {
        error!(error = %e, "Accept loop panicked");
    }
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
}

async fn accept_loop(
    listener: TcpListener,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    connections.spawn(handle_connection(
                        socket,
                        peer,
                        handler.clone(),
                        Arc::clone(&stats),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => error!(error = %e, "Failed to accept connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Connection task failed");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    debug!(open = connections.len(), "Listener closed, draining connections");

    if tokio::time::timeout(grace, drain(&mut connections)).await.is_err() {
        warn!(
            remaining = connections.len(),
            "Grace period elapsed, aborting connections"
        );
        connections.abort_all();
        drain(&mut connections).await;
    }
}

async fn drain(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Connection task panicked");
            }
        }
    }
}
