//! # StreamKV - An In-Memory Data Store Speaking RESP
//!
//! StreamKV serves strings, lists and append-only streams over the Redis
//! Serialization Protocol. Any Redis client can talk to it.
//!
//! ## Features
//!
//! - **Strings with expiry**: `SET ... PX`, expired keys vanish on access and
//!   are swept in the background
//! - **Lists with blocking pops**: `BLPOP` suspends without holding the store
//!   and is served directly by the next push
//! - **Streams**: `XADD` with `*`, `<ms>-*` and explicit ids, `XRANGE`
//! - **Pipelining**: any number of commands per read, answered in order
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              StreamKV                               │
//! │                                                                     │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐              │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │              │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │              │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘              │
//! │                            │                  │                     │
//! │                            ▼                  ▼                     │
//! │                     ┌─────────────┐   ┌───────────────────────────┐ │
//! │                     │ RESP decode │   │ StorageEngine             │ │
//! │                     │ RESP encode │   │ Mutex<Keyspace>           │ │
//! │                     └─────────────┘   │ strings, lists, streams,  │ │
//! │                                       │ BLPOP waiters, deadlines  │ │
//! │                                       └─────────────▲─────────────┘ │
//! │                                                     │               │
//! │                                       ┌─────────────┴─────────────┐ │
//! │                                       │ ExpirySweeper (tokio task)│ │
//! │                                       └───────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use streamkv::storage::{StorageEngine, start_expiry_sweeper};
//! use streamkv::commands::CommandHandler;
//! use streamkv::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&storage));
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::new(Arc::clone(&storage));
//!         tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP request decoder and reply encoder
//! - [`storage`]: the keyspace, blocking pops, stream ids and expiry
//! - [`commands`]: command table and dispatch
//! - [`connection`]: per-client connection tasks
//!
//! ## Design Highlights
//!
//! ### One Guard
//!
//! All keys live behind a single mutex. Each command is atomic with respect to
//! every other command; only socket I/O and RESP framing run in parallel.
//!
//! ### Lazy + Active Expiry
//!
//! Keys with a TTL expire in two ways:
//! 1. **Lazy**: any access to an expired key treats it as absent and drops it
//! 2. **Active**: a background task sleeps until the next deadline and purges
//!
//! A rewrite of the key cancels the old deadline, so a stale timer never
//! deletes a newer value.

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port StreamKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host StreamKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of StreamKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
