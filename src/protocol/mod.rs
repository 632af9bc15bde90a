//! RESP Protocol
//!
//! Decoding of client requests and encoding of replies in the Redis
//! Serialization Protocol.
//!
//! - `parser`: incremental decoder turning buffered bytes into commands
//! - `types`: the `RespValue` reply model and its wire encoding
//!
//! ## Example
//!
//! ```
//! use streamkv::protocol::{RespValue, parse_message};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (command, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(command, vec![Bytes::from("GET"), Bytes::from("name")]);
//! assert_eq!(consumed, data.len());
//!
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, Command, ParseError, ParseResult, RespParser};
pub use types::RespValue;
