//! Client Connections
//!
//! Each accepted socket is served by its own Tokio task running a
//! [`ConnectionHandler`]. Connections share only the command handler's
//! storage engine and the [`ConnectionStats`] counters.
//!
//! ```text
//! TcpListener::accept()
//!        │ spawn task per client
//!        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ ConnectionHandler                                    │
//! │  read bytes ─> decode ─> execute ─> buffer reply     │
//! │       ▲                                   │          │
//! │       └──────────── flush ◄───────────────┘          │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
