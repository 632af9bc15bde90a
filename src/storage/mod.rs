//! Storage Module
//!
//! The keyspace behind every command: strings with optional expiry, lists
//! with blocking pops, and append-only streams.
//!
//! ```text
//!        connections ──────────┐
//!                              ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ StorageEngine (one guard over the keyspace)  │
//!   │   engine    key -> String | List | Stream    │
//!   │   blocking  BLPOP wait-sets + handoff        │
//!   │   stream    ids, entries, ranges             │
//!   │   expiry    deadline index                   │
//!   └──────────────────────────────────────────────┘
//!                              ▲
//!                    ExpirySweeper (tokio task)
//! ```
//!
//! ## Example
//!
//! ```
//! use streamkv::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//!
//! engine.set(Bytes::from("session"), Bytes::from("token123"), Some(Duration::from_secs(3600)));
//! assert_eq!(engine.get(&Bytes::from("session")), Ok(Some(Bytes::from("token123"))));
//!
//! engine.lpush(Bytes::from("jobs"), vec![Bytes::from("a"), Bytes::from("b")]).unwrap();
//! assert_eq!(engine.llen(&Bytes::from("jobs")), Ok(2));
//! ```

pub mod blocking;
pub mod engine;
pub mod expiry;
pub mod stream;

pub use blocking::Popped;
pub use engine::{normalize_range, ListEnd, StorageEngine, StorageError, StorageResult, StorageStats};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use stream::{Fields, IdRequest, StreamEntry, StreamId, StreamIdError};
