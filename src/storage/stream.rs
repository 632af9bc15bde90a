//! Stream entries and entry-ID generation.
//!
//! A stream is an append-only log whose entries are keyed by `<ms>-<seq>` ids
//! in strictly increasing order. XADD callers ask for an id in one of three
//! shapes and [`IdRequest::resolve`] turns the request into a concrete id or
//! rejects it against the stream's current top entry.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a stream entry.
///
/// Ordering is lexicographic on `(ms, seq)`, which the derived `Ord` gives us
/// from the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parses a range bound used by XRANGE.
    ///
    /// `-` and `+` are the smallest and largest ids. A bare `<ms>` expands to
    /// `<ms>-0` for a start bound and `<ms>-<max>` for an end bound.
    pub fn parse_range_bound(s: &str, is_start: bool) -> Result<StreamId, StreamIdError> {
        match s {
            "-" => return Ok(StreamId::MIN),
            "+" => return Ok(StreamId::MAX),
            _ => {}
        }

        match s.split_once('-') {
            Some(_) => s.parse(),
            None => {
                let ms = parse_part(s)?;
                let seq = if is_start { 0 } else { u64::MAX };
                Ok(StreamId::new(ms, seq))
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').ok_or(StreamIdError::Invalid)?;
        Ok(StreamId::new(parse_part(ms)?, parse_part(seq)?))
    }
}

fn parse_part(s: &str) -> Result<u64, StreamIdError> {
    // u64::from_str accepts a leading '+', ids do not
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StreamIdError::Invalid);
    }
    s.parse().map_err(|_| StreamIdError::Invalid)
}

/// Reasons an id request is rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("Invalid stream ID specified as stream command argument")]
    Invalid,

    #[error("The ID specified in XADD must be greater than 0-0")]
    ZeroId,

    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    NotGreaterThanTop,
}

/// The id shape requested by an XADD caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRequest {
    /// `*`: timestamp from the wall clock, sequence auto-assigned
    Auto,
    /// `<ms>-*`: caller timestamp, sequence auto-assigned
    AutoSequence(u64),
    /// `<ms>-<seq>`: fully specified
    Explicit(StreamId),
}

impl FromStr for IdRequest {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(IdRequest::Auto);
        }

        match s.split_once('-') {
            Some((ms, "*")) => Ok(IdRequest::AutoSequence(parse_part(ms)?)),
            Some(_) => Ok(IdRequest::Explicit(s.parse()?)),
            // A bare timestamp means `<ms>-0`
            None => Ok(IdRequest::Explicit(StreamId::new(parse_part(s)?, 0))),
        }
    }
}

impl IdRequest {
    /// Produces the concrete id for this request.
    ///
    /// `last` is the stream's current top id (None for an empty or new stream)
    /// and `now_ms` the wall clock in milliseconds since the Unix epoch.
    pub fn resolve(self, last: Option<StreamId>, now_ms: u64) -> Result<StreamId, StreamIdError> {
        match self {
            IdRequest::Auto => Ok(match last {
                None => StreamId::new(now_ms, 0),
                Some(last) if now_ms > last.ms => StreamId::new(now_ms, 0),
                // Same millisecond, or the clock went backwards
                Some(last) => match last.seq.checked_add(1) {
                    Some(seq) => StreamId::new(last.ms, seq),
                    None => StreamId::new(
                        last.ms.checked_add(1).ok_or(StreamIdError::NotGreaterThanTop)?,
                        0,
                    ),
                },
            }),
            IdRequest::AutoSequence(ms) => match last {
                None if ms == 0 => Ok(StreamId::new(0, 1)),
                None => Ok(StreamId::new(ms, 0)),
                Some(last) if ms > last.ms => Ok(StreamId::new(ms, 0)),
                Some(last) if ms == last.ms => last
                    .seq
                    .checked_add(1)
                    .map(|seq| StreamId::new(ms, seq))
                    .ok_or(StreamIdError::NotGreaterThanTop),
                Some(_) => Err(StreamIdError::NotGreaterThanTop),
            },
            IdRequest::Explicit(id) => {
                if id == StreamId::MIN {
                    return Err(StreamIdError::ZeroId);
                }
                match last {
                    Some(last) if id <= last => Err(StreamIdError::NotGreaterThanTop),
                    _ => Ok(id),
                }
            }
        }
    }
}

/// Field/value pairs of one entry, in the order the client sent them.
pub type Fields = Vec<(Bytes, Bytes)>;

/// One stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

/// An append-only log of entries ordered by strictly increasing id.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Fields>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the newest entry.
    pub fn last_id(&self) -> Option<StreamId> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves `request` against the current top entry and appends.
    ///
    /// On error the stream is left unchanged.
    pub fn append(
        &mut self,
        request: IdRequest,
        fields: Fields,
        now_ms: u64,
    ) -> Result<StreamId, StreamIdError> {
        let id = request.resolve(self.last_id(), now_ms)?;
        debug_assert!(self.last_id().map_or(true, |last| id > last));
        self.entries.insert(id, fields);
        Ok(id)
    }

    /// Entries with `start <= id <= end`, oldest first, at most `count` of them.
    pub fn range(&self, start: StreamId, end: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        if start > end {
            return Vec::new();
        }

        self.entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect()
    }
}
