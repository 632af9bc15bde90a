//! Per-client connection task.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects, ConnectionHandler spawned
//!        │
//!        ▼
//! 2. ┌──────────────────────────────────────┐
//!    │  Main Loop                           │
//!    │                                      │
//!    │  decode every complete command ──┐   │
//!    │  execute + buffer reply, in order│   │
//!    │  ◄───────────────────────────────┘   │
//!    │  flush replies                       │
//!    │  read more bytes from the socket     │
//!    │         [loop back]                  │
//!    └──────────────────────────────────────┘
//!        │
//!        ▼
//! 3. EOF, I/O error or protocol error: task ends
//! ```
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut`. TCP delivers a stream, so one
//! read may hold several pipelined commands or only part of one; the decoder
//! consumes whole commands and leaves the rest buffered for the next read.
//!
//! ## Blocking Commands
//!
//! While a command is suspended (BLPOP), the socket is still read so that a
//! client hanging up is noticed at once. Dropping the suspended command
//! withdraws its wait registration.

use crate::commands::CommandHandler;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{Command, ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer: one maximal bulk string plus framing
pub const MAX_BUFFER_SIZE: usize = MAX_BULK_SIZE + 64 * 1024;

/// Read buffer capacity of a fresh connection
pub const INITIAL_BUFFER_SIZE: usize = 4096;

/// Server-wide connection counters, shared by every connection task.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Connections accepted since startup
    pub accepted: AtomicU64,
    /// Connections currently open
    pub active: AtomicU64,
    /// Commands executed, errors included
    pub commands: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Serves one client socket.
pub struct ConnectionHandler {
    /// Replies are buffered here and flushed once per batch of commands
    socket: BufWriter<TcpStream>,

    peer: SocketAddr,

    /// Bytes received but not yet decoded
    pending: BytesMut,

    commands: CommandHandler,

    decoder: RespParser,

    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.opened();

        Self {
            socket: BufWriter::new(socket),
            peer,
            pending: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands,
            decoder: RespParser::new(),
            stats,
        }
    }

    /// Serves the client until it hangs up or the connection fails.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.peer, "Client connected");

        let outcome = self.serve().await;

        match &outcome {
            Ok(()) | Err(ConnectionError::Closed) => info!(
                client = %self.peer,
                commands = self.decoder.decoded(),
                "Client disconnected"
            ),
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.peer, "Connection reset by peer")
            }
            Err(e) => warn!(client = %self.peer, error = %e, "Closing connection"),
        }

        self.stats.closed();
        outcome
    }

    /// Decode everything buffered, answer it in order, flush, then read again.
    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(command) = self.next_command().await? {
                if self.commands.may_block(&command) {
                    // Earlier pipelined replies must not wait behind a blocked pop
                    self.socket.flush().await?;
                }

                let reply = self.execute(command).await?;
                ConnectionStats::add(&self.stats.commands, 1);
                self.queue_reply(&reply).await?;
            }

            self.socket.flush().await?;
            self.fill_buffer().await?;
        }
    }

    /// Decodes the next buffered command.
    ///
    /// A framing error is reported to the client before the connection is
    /// closed.
    async fn next_command(&mut self) -> Result<Option<Command>, ConnectionError> {
        match self.decoder.decode(&mut self.pending) {
            Ok(Some(command)) => {
                trace!(
                    client = %self.peer,
                    args = command.len(),
                    buffered = self.pending.len(),
                    "Decoded command"
                );
                Ok(Some(command))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(client = %self.peer, error = %e, "Malformed request");
                let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                self.queue_reply(&reply).await?;
                self.socket.flush().await?;
                Err(ConnectionError::Protocol(e))
            }
        }
    }

    /// Runs one command while watching the socket for a hang-up.
    ///
    /// Bytes that arrive in the meantime are buffered for later commands.
    async fn execute(&mut self, command: Command) -> Result<RespValue, ConnectionError> {
        let Self {
            socket,
            pending,
            commands,
            stats,
            peer,
            ..
        } = self;

        let execution = commands.execute(command);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                biased;

                reply = &mut execution => return Ok(reply),
                read = socket.get_mut().read_buf(&mut *pending), if pending.len() < MAX_BUFFER_SIZE => {
                    let n = read?;
                    if n == 0 {
                        debug!(client = %peer, "Client went away during a blocking command");
                        return Err(ConnectionError::Closed);
                    }
                    ConnectionStats::add(&stats.bytes_in, n);
                }
            }
        }
    }

    async fn fill_buffer(&mut self) -> Result<(), ConnectionError> {
        if self.pending.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.peer,
                buffered = self.pending.len(),
                "Request exceeds the read buffer limit"
            );
            return Err(ConnectionError::RequestTooLarge);
        }

        if self.pending.capacity() - self.pending.len() < 1024 {
            self.pending.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.socket.get_mut().read_buf(&mut self.pending).await?;
        if n == 0 {
            return Err(if self.pending.is_empty() {
                ConnectionError::Closed
            } else {
                ConnectionError::TruncatedRequest
            });
        }

        ConnectionStats::add(&self.stats.bytes_in, n);
        trace!(client = %self.peer, bytes = n, "Read from socket");
        Ok(())
    }

    /// Queues a reply; it reaches the client on the next flush.
    async fn queue_reply(&mut self, reply: &RespValue) -> Result<(), ConnectionError> {
        let encoded = reply.serialize();
        self.socket.write_all(&encoded).await?;
        ConnectionStats::add(&self.stats.bytes_out, encoded.len());
        Ok(())
    }
}

/// Reasons a connection ends.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The request stream could not be framed; the client got an error reply
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The client closed its end between requests
    #[error("connection closed by client")]
    Closed,

    /// The client closed its end in the middle of a request
    #[error("connection closed mid-request")]
    TruncatedRequest,

    #[error("request exceeds the read buffer limit")]
    RequestTooLarge,
}

/// Serves `socket` to completion. Used as the body of each connection task.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let _ = ConnectionHandler::new(socket, peer, commands, stats).run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Binds an ephemeral port and serves it the way the binary does.
    async fn spawn_server() -> (SocketAddr, Arc<StorageEngine>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());

        let (server_storage, server_stats) = (Arc::clone(&storage), Arc::clone(&stats));
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                let commands = CommandHandler::new(Arc::clone(&server_storage));
                tokio::spawn(handle_connection(socket, peer, commands, Arc::clone(&server_stats)));
            }
        });

        (addr, storage, stats)
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    /// Reads exactly `expected.len()` bytes and compares them.
    async fn expect_reply(client: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    async fn wait_for_blocked(storage: &StorageEngine, count: usize) {
        for _ in 0..200 {
            if storage.blocked_clients() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} blocked clients", count);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;

        // Inline form, as typed into telnet
        client.write_all(b"PING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn test_set_get() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"+OK\r\n").await;

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"$4\r\nAriz\r\n").await;
    }

    #[tokio::test]
    async fn test_pipelined_commands_answered_in_order() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk2\r\n")
            .await
            .unwrap();

        expect_reply(&mut client, b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n").await;
    }

    #[tokio::test]
    async fn test_command_split_across_writes() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        let command = b"*3\r\n$5\r\nRPUSH\r\n$4\r\nlist\r\n$5\r\nhello\r\n";
        for chunk in command.chunks(7) {
            client.write_all(chunk).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        expect_reply(&mut client, b":1\r\n").await;
    }

    #[tokio::test]
    async fn test_binary_safe_values() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$6\r\n\r\n*1\r\n\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"+OK\r\n").await;

        client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nbin\r\n").await.unwrap();
        expect_reply(&mut client, b"$6\r\n\r\n*1\r\n\r\n").await;
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client.write_all(b"*1\r\n$3\r\nGET\r\n").await.unwrap();
        expect_reply(&mut client, b"-ERR wrong number of arguments for 'get' command\r\n").await;

        client.write_all(b"*1\r\n$4\r\nNOPE\r\n").await.unwrap();
        expect_reply(&mut client, b"-ERR unknown command 'NOPE'\r\n").await;

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client.write_all(b"*1\r\n$x\r\nPING\r\n").await.unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("server kept the connection open")
            .unwrap();
        assert!(buf.starts_with(b"-ERR Protocol error"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blpop_woken_by_other_connection() {
        let (addr, storage, _) = spawn_server().await;
        let mut consumer = connect(addr).await;
        let mut producer = connect(addr).await;

        consumer
            .write_all(b"*3\r\n$5\r\nBLPOP\r\n$5\r\nqueue\r\n$1\r\n0\r\n")
            .await
            .unwrap();
        wait_for_blocked(&storage, 1).await;

        // The blocked client does not hold up anyone else
        producer.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut producer, b"+PONG\r\n").await;

        producer
            .write_all(b"*3\r\n$5\r\nRPUSH\r\n$5\r\nqueue\r\n$3\r\njob\r\n")
            .await
            .unwrap();
        expect_reply(&mut producer, b":1\r\n").await;
        expect_reply(&mut consumer, b"*2\r\n$5\r\nqueue\r\n$3\r\njob\r\n").await;
    }

    #[tokio::test]
    async fn test_blpop_timeout_returns_nil_array() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*3\r\n$5\r\nBLPOP\r\n$5\r\nempty\r\n$3\r\n0.1\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"*-1\r\n").await;
    }

    #[tokio::test]
    async fn test_replies_before_blpop_are_flushed() {
        let (addr, _, _) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*1\r\n$4\r\nPING\r\n*3\r\n$5\r\nBLPOP\r\n$1\r\nq\r\n$1\r\n0\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_while_blocked_unregisters() {
        let (addr, storage, stats) = spawn_server().await;
        let mut client = connect(addr).await;

        client
            .write_all(b"*3\r\n$5\r\nBLPOP\r\n$4\r\ngone\r\n$1\r\n0\r\n")
            .await
            .unwrap();
        wait_for_blocked(&storage, 1).await;

        drop(client);
        wait_for_blocked(&storage, 0).await;

        // The element stays in the list instead of going to the dead client
        assert_eq!(storage.rpush("gone".into(), vec!["x".into()]), Ok(1));
        assert_eq!(storage.llen(&"gone".into()), Ok(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = spawn_server().await;

        assert_eq!(stats.active.load(Ordering::Relaxed), 0);

        let mut client = connect(addr).await;

        // Give the server time to accept the connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;

        assert!(stats.commands.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_in.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_out.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
    }
}
