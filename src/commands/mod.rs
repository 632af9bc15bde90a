//! Command Layer
//!
//! Receives decoded commands, validates them against a static command table,
//! executes them against the storage engine and produces the reply.
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Decoder   │  (protocol module)
//! └────────┬────────┘
//!          │ Vec<Bytes>
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  table lookup, arity, execution
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! Failures never escape as Rust errors: each becomes exactly one RESP error
//! reply and the connection carries on.

pub mod error;
pub mod handler;
pub mod table;

pub use error::CommandError;
pub use handler::CommandHandler;
