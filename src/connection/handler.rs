//! Per-client connection loop.
//!
//! ```text
//!   ┌──────────► Reading ───── peer closed / shutdown ──► done
//!   │               │
//!   │               ▼
//!   │          Dispatching ─── QUIT / fatal parse error ─► flush, done
//!   │               │
//!   │               ▼
//!   └────────── Writing
//! ```
//!
//! Incoming bytes accumulate in a `BytesMut` because one read may hold half a
//! frame or several pipelined frames. Every complete frame in the buffer is
//! dispatched before the replies are written with a single flush.
//!
//! Dispatch is synchronous, so no storage lock is ever held across an await.

use crate::commands::{is_quit, CommandHandler};
use crate::protocol::{decode_command, Frame, ParseError, RespValue};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// A client whose unparsed input grows past this is disconnected.
const MAX_BUFFER_SIZE: usize = 1024 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Counters shared by every connection of one server.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: AtomicU64,
    active: AtomicU64,
    commands: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub accepted: u64,
    pub active: u64,
    pub commands: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectionCounts {
        ConnectionCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Parse(#[from] ParseError),

    /// The peer closed the stream in the middle of a frame.
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Query buffer limit exceeded")]
    BufferFull,
}

/// What to do after dispatching the buffered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serves one client over any byte stream.
pub struct ConnectionHandler<S> {
    stream: BufWriter<S>,
    addr: SocketAddr,
    buffer: BytesMut,

    /// Replies produced by the current batch of frames.
    replies: Vec<u8>,

    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            replies: Vec::new(),
            command_handler,
            stats,
            shutdown,
        }
    }

    /// Serves the client until it disconnects, sends QUIT, breaks the
    /// protocol or the server shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        self.stats.opened();
        debug!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "Client disconnected"),
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "Connection reset by client")
            }
            // Already reported when it was decoded.
            Err(ConnectionError::Parse(_)) => {}
            Err(e) => warn!(client = %self.addr, error = %e, "Connection closed with error"),
        }

        self.stats.closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let flow = match self.dispatch_buffered() {
                Ok(flow) => flow,
                Err(e) => {
                    let _ = self.write_replies().await;
                    return Err(e);
                }
            };
            self.write_replies().await?;

            if flow == Flow::Close || self.shutdown_requested() {
                return Ok(());
            }

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                return Err(ConnectionError::BufferFull);
            }
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            let n = tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => read?,
                _ = self.shutdown.changed() => {
                    trace!(client = %self.addr, "Shutdown while idle");
                    return Ok(());
                }
            };

            if n == 0 {
                return if self.buffer.is_empty() {
                    Ok(())
                } else {
                    Err(ConnectionError::UnexpectedEof)
                };
            }

            self.stats.add_read(n);
            trace!(client = %self.addr, bytes = n, "Read data");
        }
    }

    /// Executes every complete frame in the buffer, queueing the replies.
    ///
    /// A fatal parse error queues its error reply before being returned so
    /// the client still learns why it was dropped.
    fn dispatch_buffered(&mut self) -> Result<Flow, ConnectionError> {
        loop {
            if self.shutdown_requested() {
                return Ok(Flow::Close);
            }

            let (frame, consumed) = match decode_command(&self.buffer) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(Flow::Continue),
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Protocol error");
                    RespValue::error(format!("ERR Protocol error: {}", e))
                        .serialize_into(&mut self.replies);
                    return Err(e.into());
                }
            };
            self.buffer.advance(consumed);

            match frame {
                Frame::Command(request) if request.is_empty() => {}
                Frame::Command(request) => {
                    let reply = self.command_handler.execute(&request);
                    self.stats.add_command();
                    reply.serialize_into(&mut self.replies);

                    if is_quit(&request) {
                        return Ok(Flow::Close);
                    }
                }
                Frame::Invalid(reason) => {
                    debug!(client = %self.addr, reason, "Invalid request frame");
                    RespValue::error(format!("ERR Protocol error: {}", reason))
                        .serialize_into(&mut self.replies);
                }
            }
        }
    }

    async fn write_replies(&mut self) -> Result<(), ConnectionError> {
        if self.replies.is_empty() {
            return Ok(());
        }

        self.stream.write_all(&self.replies).await?;
        self.stream.flush().await?;

        self.stats.add_written(self.replies.len());
        trace!(client = %self.addr, bytes = self.replies.len(), "Sent replies");
        self.replies.clear();
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Runs a [`ConnectionHandler`] to completion, logging instead of returning
/// its error. This is what the accept loop spawns per client.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, shutdown);
    if let Err(e) = handler.run().await {
        debug!(client = %addr, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::time::Duration;
    use tokio_test::io::{Builder, Mock};

    struct Harness {
        storage: Arc<StorageEngine>,
        stats: Arc<ConnectionStats>,
        shutdown_tx: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                storage: Arc::new(StorageEngine::new()),
                stats: Arc::new(ConnectionStats::new()),
                shutdown_tx,
            }
        }

        fn handler(&self, mock: Mock) -> ConnectionHandler<Mock> {
            ConnectionHandler::new(
                mock,
                "127.0.0.1:50000".parse().unwrap(),
                CommandHandler::new(Arc::clone(&self.storage)),
                Arc::clone(&self.stats),
                self.shutdown_tx.subscribe(),
            )
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_get() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .write(b"+OK\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .write(b"$4\r\nAriz\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
        assert_eq!(harness.storage.get(b"name"), Some("Ariz".into()));
    }

    #[tokio::test]
    async fn test_pipelined_replies_in_order() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"+OK\r\n$2\r\nv1\r\n+PONG\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
        assert_eq!(harness.stats.snapshot().commands, 3);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*2\r\n$3\r\nGE")
            .read(b"T\r\n$4\r\nna")
            .read(b"me\r\n")
            .write(b"$-1\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_inline_command() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"SET greeting hello\r\nGET greeting\r\n")
            .write(b"+OK\r\n$5\r\nhello\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_frame_keeps_connection() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b":42\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"-ERR Protocol error: expected an array of bulk strings\r\n+PONG\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_parse_error_closes_connection() {
        let harness = Harness::new();
        // The PING after the broken header is never executed.
        let mock = Builder::new()
            .read(b"*1\r\n$abc\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"-ERR Protocol error: invalid bulk length\r\n")
            .build();

        let err = harness.handler(mock).run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Parse(ParseError::InvalidBulkLength)));
        assert_eq!(harness.stats.snapshot().commands, 0);
    }

    #[tokio::test]
    async fn test_protocol_error_reply_stays_on_one_line() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b":1\n2\r\n")
            .write(b"-ERR Protocol error: invalid integer: 1 2\r\n")
            .build();

        let err = harness.handler(mock).run().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Parse(ParseError::InvalidInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nQUIT\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .write(b"+OK\r\n")
            .build();

        harness.handler(mock).run().await.unwrap();
        assert!(harness.storage.is_empty());
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let harness = Harness::new();
        let mock = Builder::new().read(b"*2\r\n$3\r\nGET\r\n").build();

        let err = harness.handler(mock).run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_shutdown_before_reading() {
        let harness = Harness::new();
        harness.shutdown_tx.send_replace(true);

        let mock = Builder::new().build();
        harness.handler(mock).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .wait(Duration::from_secs(5))
            .build();

        let task = tokio::spawn(harness.handler(mock).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.shutdown_tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler did not observe shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let harness = Harness::new();
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        let handler = harness.handler(mock);
        assert_eq!(harness.stats.snapshot(), ConnectionCounts::default());
        handler.run().await.unwrap();

        let counts = harness.stats.snapshot();
        assert_eq!(counts.accepted, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.commands, 1);
        assert_eq!(counts.bytes_read, 14);
        assert_eq!(counts.bytes_written, 7);
    }
}
