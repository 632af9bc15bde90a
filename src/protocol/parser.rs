//! Incremental RESP Request Decoder
//!
//! Clients send commands as arrays of bulk strings:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
//! ```
//!
//! The decoder is fed whatever the socket delivered so far and returns either:
//! - `Ok(Some((command, consumed)))` - a complete command, `consumed` bytes were used
//! - `Ok(None)` - the command is incomplete, read more data and call again
//! - `Err(ParseError)` - the framing is broken, the connection must be closed
//!
//! Nothing is consumed until a whole command is available, so a command split
//! across reads is simply re-parsed from its first byte once more data arrives.
//! Bulk bodies are sliced by their declared length and never scanned for CRLF,
//! which keeps them binary safe.
//!
//! Lines that do not start with `*` are treated as inline commands
//! (`PING\r\n`, `SET a b\r\n`), the way `redis-cli` and telnet sessions send them.

use crate::protocol::types::{prefix, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// A decoded command: the name followed by its arguments.
pub type Command = Vec<Bytes>;

/// Errors that can occur while decoding requests. All of them are fatal to the
/// connection that produced the bytes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A length line is not a valid integer
    #[error("invalid {kind} length: {text:?}")]
    InvalidLength { kind: &'static str, text: String },

    /// Bulk string length is negative
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array element that is not a bulk string
    #[error("expected '$', got {:?}", char::from(*.0))]
    UnexpectedPrefix(u8),

    /// Protocol violation (missing CRLF, unbalanced quotes, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A declared size exceeds the configured maximum
    #[error("message too large: {size} (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in one request
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum length of a header or inline line without a terminator
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// An incremental request decoder.
///
/// # Example
///
/// ```
/// use streamkv::protocol::RespParser;
/// use bytes::BytesMut;
///
/// let mut parser = RespParser::new();
/// let mut buffer = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET"[..]);
///
/// let command = parser.decode(&mut buffer).unwrap().unwrap();
/// assert_eq!(command, vec![bytes::Bytes::from("PING")]);
///
/// // The second command is still incomplete and stays buffered.
/// assert!(parser.decode(&mut buffer).unwrap().is_none());
/// assert_eq!(&buffer[..], b"*2\r\n$3\r\nGET");
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Commands decoded over the parser's lifetime
    decoded: u64,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { decoded: 0 }
    }

    /// Number of commands this parser has produced.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Decodes the next non-empty command from the front of `buf`, advancing it
    /// past the consumed bytes.
    ///
    /// Empty frames (`*0\r\n`, blank inline lines) are consumed and skipped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ParseResult<Option<Command>> {
        loop {
            match self.parse(buf)? {
                Some((command, consumed)) => {
                    buf.advance(consumed);
                    if !command.is_empty() {
                        self.decoded += 1;
                        return Ok(Some(command));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Attempts to parse one frame from the start of `buf` without consuming it.
    ///
    /// The returned command may be empty for empty frames.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            prefix::ARRAY => self.parse_array(buf),
            _ => self.parse_inline(buf),
        }
    }

    /// Parses `*<count>\r\n` followed by `count` bulk strings.
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        debug_assert!(buf[0] == prefix::ARRAY);

        let Some((count, mut consumed)) = parse_length_line(buf, "multibulk")? else {
            return Ok(None);
        };

        // Redis treats non-positive counts as an empty request
        if count <= 0 {
            return Ok(Some((Vec::new(), consumed)));
        }

        let count = count as usize;
        if count > MAX_ARRAY_LEN {
            return Err(ParseError::MessageTooLarge {
                size: count,
                max: MAX_ARRAY_LEN,
            });
        }

        let mut elements = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            match parse_bulk_string(&buf[consumed..])? {
                Some((data, element_consumed)) => {
                    elements.push(data);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((elements, consumed)))
    }

    /// Parses a whitespace separated inline command terminated by LF, with or
    /// without a preceding CR.
    fn parse_inline(&mut self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        let Some(lf_pos) = buf.iter().position(|&b| b == b'\n') else {
            check_line_limit(buf)?;
            return Ok(None);
        };
        let line = buf[..lf_pos].strip_suffix(b"\r").unwrap_or(&buf[..lf_pos]);

        let line = std::str::from_utf8(line)
            .map_err(|e| ParseError::ProtocolError(format!("invalid inline command: {}", e)))?;

        let elements = line
            .split_whitespace()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect();

        Ok(Some((elements, lf_pos + 1)))
    }
}

/// Parses a bulk string: `$<length>\r\n<data>\r\n`
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != prefix::BULK_STRING {
        return Err(ParseError::UnexpectedPrefix(first));
    }

    let Some((length, data_start)) = parse_length_line(buf, "bulk")? else {
        return Ok(None);
    };

    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((data, total_needed)))
}

/// Parses `<prefix><integer>\r\n`, returning the integer and the bytes used.
fn parse_length_line(buf: &[u8], kind: &'static str) -> ParseResult<Option<(i64, usize)>> {
    let end = match find_crlf(&buf[1..]) {
        Some(pos) => pos,
        None => {
            check_line_limit(buf)?;
            return Ok(None);
        }
    };

    let text = &buf[1..1 + end];
    let length = std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidLength {
            kind,
            text: String::from_utf8_lossy(text).into_owned(),
        })?;

    Ok(Some((length, 1 + end + 2)))
}

#[inline]
fn check_line_limit(buf: &[u8]) -> ParseResult<()> {
    if buf.len() > MAX_LINE_SIZE {
        return Err(ParseError::ProtocolError("too big inline request".to_string()));
    }
    Ok(())
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single command from bytes.
///
/// This is a convenience function for simple use cases.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Command {
        parts.iter().map(|p| Bytes::from(p.to_string())).collect()
    }

    #[test]
    fn test_parse_array_command() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        let (command, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(command, cmd(&["GET", "name"]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_incomplete_header() {
        assert!(parse_message(b"*2").unwrap().is_none());
        assert!(parse_message(b"*2\r\n$3").unwrap().is_none());
    }

    #[test]
    fn test_parse_incomplete_body() {
        assert!(parse_message(b"*2\r\n$3\r\nGET\r\n$4\r\nna").unwrap().is_none());
        assert!(parse_message(b"*1\r\n$4\r\nPING\r").unwrap().is_none());
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        // The body contains CRLF and a '*' but the declared length wins
        let input = b"*2\r\n$4\r\nECHO\r\n$6\r\na\r\n*\x00b\r\n";
        let (command, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(command[1], Bytes::from_static(b"a\r\n*\x00b"));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_empty_bulk_string() {
        let (command, _) = parse_message(b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(command, cmd(&["ECHO", ""]));
    }

    #[test]
    fn test_decode_pipelined_commands() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(
            &b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"[..],
        );

        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["PING"])));
        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["ECHO", "hi"])));
        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["GET", "k"])));
        assert_eq!(parser.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
        assert_eq!(parser.decoded(), 3);
    }

    #[test]
    fn test_decode_split_across_reads() {
        let mut parser = RespParser::new();
        let full = b"*3\r\n$5\r\nRPUSH\r\n$4\r\nlist\r\n$5\r\napple\r\n";
        let mut buf = BytesMut::new();

        for chunk in full.chunks(4) {
            assert_eq!(parser.decode(&mut buf).unwrap(), None);
            buf.extend_from_slice(chunk);
        }

        assert_eq!(
            parser.decode(&mut buf).unwrap(),
            Some(cmd(&["RPUSH", "list", "apple"]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_skips_empty_frames() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*0\r\n\r\n*1\r\n$4\r\nPING\r\n"[..]);
        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["PING"])));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_inline_command() {
        let (command, consumed) = parse_message(b"SET  key value\r\n").unwrap().unwrap();
        assert_eq!(command, cmd(&["SET", "key", "value"]));
        assert_eq!(consumed, 16);

        assert!(parse_message(b"PING").unwrap().is_none());
    }

    #[test]
    fn test_inline_command_with_bare_lf() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"ECHO hi\nPING\r\n"[..]);
        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["ECHO", "hi"])));
        assert_eq!(parser.decode(&mut buf).unwrap(), Some(cmd(&["PING"])));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unexpected_prefix_message_is_one_line() {
        let err = parse_message(b"*1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedPrefix(b'\r'));
        assert!(!err.to_string().contains('\r'));
    }

    #[test]
    fn test_invalid_array_length() {
        let result = parse_message(b"*abc\r\n");
        assert!(matches!(
            result,
            Err(ParseError::InvalidLength { kind: "multibulk", .. })
        ));
    }

    #[test]
    fn test_invalid_bulk_length() {
        assert!(matches!(
            parse_message(b"*1\r\n$x\r\nPING\r\n"),
            Err(ParseError::InvalidLength { kind: "bulk", .. })
        ));
        assert_eq!(
            parse_message(b"*1\r\n$-3\r\n"),
            Err(ParseError::InvalidBulkLength(-3))
        );
    }

    #[test]
    fn test_non_bulk_element() {
        assert_eq!(
            parse_message(b"*1\r\n:12\r\n"),
            Err(ParseError::UnexpectedPrefix(b':'))
        );
    }

    #[test]
    fn test_declared_length_mismatch() {
        let result = parse_message(b"*1\r\n$2\r\nPING\r\n");
        assert!(matches!(result, Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_oversized_bulk_rejected() {
        let input = format!("*1\r\n${}\r\n", MAX_BULK_SIZE + 1);
        assert!(matches!(
            parse_message(input.as_bytes()),
            Err(ParseError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_unterminated_line_limit() {
        let input = vec![b'a'; MAX_LINE_SIZE + 1];
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_error_leaves_buffer_untouched() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$z\r\n"[..]);
        assert!(parser.decode(&mut buf).is_err());
        assert_eq!(&buf[..], b"*1\r\n$z\r\n");
    }
}
