//! Command Dispatch
//!
//! Takes a decoded command, validates it against the command table and runs
//! it against the storage engine.
//!
//! ## Supported Commands
//!
//! ### Connection
//! - `PING [message]` - `+PONG`, or the message as a bulk string
//! - `ECHO message` - The message as a bulk string
//!
//! ### Strings
//! - `SET key value [EX seconds | PX milliseconds]` - Store a string
//! - `GET key` - Get a string, nil if absent or expired
//! - `TYPE key` - `string`, `list`, `stream` or `none`
//!
//! ### Lists
//! - `LPUSH key value [value ...]` - Prepend values, one at a time
//! - `RPUSH key value [value ...]` - Append values
//! - `LPOP key [count]` - Pop from the head
//! - `RPOP key [count]` - Pop from the tail
//! - `LLEN key` - List length
//! - `LRANGE key start stop` - Inclusive range, negative indices from the end
//! - `BLPOP key [key ...] timeout` - Pop from the head, waiting up to `timeout` seconds
//!
//! ### Streams
//! - `XADD key id field value [field value ...]` - Append an entry
//! - `XRANGE key start end [COUNT n]` - Entries with ids in `[start, end]`
//! - `XLEN key` - Number of entries
//!
//! ## Flow
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      CommandHandler                        │
//! │                                                            │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────┐    │
//! │  │  lookup()   │───>│ arity check │───>│  cmd_*()     │    │
//! │  └─────────────┘    └─────────────┘    └──────────────┘    │
//! │                                               │            │
//! │                                               ▼            │
//! │                                      StorageEngine         │
//! └────────────────────────────────────────────────────────────┘
//! ```

use crate::commands::error::CommandError;
use crate::commands::table::{self, CommandKind, CommandSpec};
use crate::protocol::{Command, RespValue};
use crate::storage::{IdRequest, ListEnd, StorageEngine, StreamEntry, StreamId, StreamIdError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type CommandResult = Result<RespValue, CommandError>;

/// Executes commands against a shared storage engine.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    /// Creates a new command handler with the given storage engine.
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Executes a command and returns the reply.
    ///
    /// Every failure is turned into an error reply. Only `BLPOP` ever awaits;
    /// all other commands complete without suspending.
    pub async fn execute(&self, command: Command) -> RespValue {
        let Some((name, args)) = command.split_first() else {
            return RespValue::error("ERR empty command");
        };

        let Some(spec) = table::lookup(name) else {
            return CommandError::UnknownCommand(String::from_utf8_lossy(name).into_owned()).into();
        };

        if !spec.arity.accepts(command.len()) {
            return CommandError::WrongArity(spec.name).into();
        }

        trace!(command = spec.name, args = args.len(), "Executing command");

        self.dispatch(spec, args)
            .await
            .unwrap_or_else(RespValue::from)
    }

    /// Whether `command` may suspend waiting for another client.
    pub fn may_block(&self, command: &Command) -> bool {
        command
            .first()
            .and_then(|name| table::lookup(name))
            .is_some_and(|spec| spec.kind == CommandKind::BLPop)
    }

    async fn dispatch(&self, spec: &CommandSpec, args: &[Bytes]) -> CommandResult {
        match spec.kind {
            CommandKind::Ping => Ok(self.cmd_ping(args)),
            CommandKind::Echo => Ok(RespValue::bulk_string(args[0].clone())),
            CommandKind::Set => self.cmd_set(args),
            CommandKind::Get => self.cmd_get(args),
            CommandKind::Type => Ok(RespValue::simple_string(self.storage.key_type(&args[0]))),
            CommandKind::LPush => self.cmd_push(args, ListEnd::Front),
            CommandKind::RPush => self.cmd_push(args, ListEnd::Back),
            CommandKind::LPop => self.cmd_pop(args, ListEnd::Front),
            CommandKind::RPop => self.cmd_pop(args, ListEnd::Back),
            CommandKind::LLen => Ok(integer_reply(self.storage.llen(&args[0])?)),
            CommandKind::LRange => self.cmd_lrange(args),
            CommandKind::BLPop => self.cmd_blpop(args).await,
            CommandKind::XAdd => self.cmd_xadd(spec, args),
            CommandKind::XRange => self.cmd_xrange(args),
            CommandKind::XLen => Ok(integer_reply(self.storage.xlen(&args[0])?)),
        }
    }

    // ========================================================================
    // Connection Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[Bytes]) -> RespValue {
        match args.first() {
            Some(msg) => RespValue::bulk_string(msg.clone()),
            None => RespValue::pong(),
        }
    }

    // ========================================================================
    // String Commands
    // ========================================================================

    /// SET key value [EX seconds | PX milliseconds]
    fn cmd_set(&self, args: &[Bytes]) -> CommandResult {
        let key = args[0].clone();
        let value = args[1].clone();

        let mut ttl = None;
        let mut options = args[2..].iter();
        while let Some(option) = options.next() {
            let unit_ms = if option.eq_ignore_ascii_case(b"EX") {
                1000
            } else if option.eq_ignore_ascii_case(b"PX") {
                1
            } else {
                return Err(CommandError::Syntax);
            };

            if ttl.is_some() {
                return Err(CommandError::Syntax);
            }
            let amount = options.next().ok_or(CommandError::Syntax)?;
            let amount = parse_integer(amount)
                .ok()
                .filter(|n| *n > 0)
                .and_then(|n| (n as u64).checked_mul(unit_ms))
                .ok_or(CommandError::InvalidExpireTime("set"))?;
            ttl = Some(Duration::from_millis(amount));
        }

        self.storage.set(key, value, ttl);
        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> CommandResult {
        Ok(match self.storage.get(&args[0])? {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        })
    }

    // ========================================================================
    // List Commands
    // ========================================================================

    /// LPUSH/RPUSH key value [value ...]
    fn cmd_push(&self, args: &[Bytes], end: ListEnd) -> CommandResult {
        let key = args[0].clone();
        let values = args[1..].to_vec();

        let len = match end {
            ListEnd::Front => self.storage.lpush(key, values)?,
            ListEnd::Back => self.storage.rpush(key, values)?,
        };
        Ok(integer_reply(len))
    }

    /// LPOP/RPOP key [count]
    ///
    /// Without a count the reply is one bulk string or nil. With a count it is
    /// always an array, empty if the list is absent; negative counts pop nothing.
    fn cmd_pop(&self, args: &[Bytes], end: ListEnd) -> CommandResult {
        let key = &args[0];

        let Some(count) = args.get(1) else {
            let mut popped = self.storage.pop(key, end, 1)?;
            return Ok(match popped.pop() {
                Some(value) => RespValue::bulk_string(value),
                None => RespValue::null(),
            });
        };

        let count = usize::try_from(parse_integer(count)?.max(0)).unwrap_or(usize::MAX);
        if count == 0 {
            // Still has to reject a key of the wrong kind
            self.storage.llen(key)?;
            return Ok(RespValue::array(vec![]));
        }

        Ok(RespValue::bulk_array(self.storage.pop(key, end, count)?))
    }

    /// LRANGE key start stop
    fn cmd_lrange(&self, args: &[Bytes]) -> CommandResult {
        let start = parse_integer(&args[1])?;
        let stop = parse_integer(&args[2])?;

        Ok(RespValue::bulk_array(self.storage.lrange(&args[0], start, stop)?))
    }

    /// BLPOP key [key ...] timeout
    async fn cmd_blpop(&self, args: &[Bytes]) -> CommandResult {
        let (timeout, keys) = args.split_last().ok_or(CommandError::WrongArity("blpop"))?;
        let timeout = parse_timeout(timeout)?;

        Ok(match self.storage.blpop(keys, timeout).await? {
            Some((key, value)) => RespValue::bulk_array([key, value]),
            None => RespValue::null_array(),
        })
    }

    // ========================================================================
    // Stream Commands
    // ========================================================================

    /// XADD key id field value [field value ...]
    fn cmd_xadd(&self, spec: &CommandSpec, args: &[Bytes]) -> CommandResult {
        let pairs = &args[2..];
        if pairs.len() % 2 != 0 {
            return Err(CommandError::WrongArity(spec.name));
        }

        let request: IdRequest = std::str::from_utf8(&args[1])
            .map_err(|_| StreamIdError::Invalid)?
            .parse()?;
        let fields = pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        let id = self.storage.xadd(args[0].clone(), request, fields)?;
        Ok(RespValue::simple_string(id.to_string()))
    }

    /// XRANGE key start end [COUNT n]
    fn cmd_xrange(&self, args: &[Bytes]) -> CommandResult {
        let start = parse_range_bound(&args[1], true)?;
        let end = parse_range_bound(&args[2], false)?;

        let count = match &args[3..] {
            [] => None,
            [option, n] if option.eq_ignore_ascii_case(b"COUNT") => {
                Some(usize::try_from(parse_integer(n)?.max(0)).unwrap_or(usize::MAX))
            }
            _ => return Err(CommandError::Syntax),
        };

        if count == Some(0) {
            return Ok(RespValue::array(vec![]));
        }

        let entries = self.storage.xrange(&args[0], start, end, count)?;
        Ok(RespValue::array(entries.into_iter().map(entry_reply).collect()))
    }
}

/// `[id, [field, value, ...]]`
fn entry_reply(entry: StreamEntry) -> RespValue {
    let fields = entry
        .fields
        .into_iter()
        .flat_map(|(field, value)| [field, value]);

    RespValue::array(vec![
        RespValue::bulk_string(entry.id.to_string()),
        RespValue::bulk_array(fields),
    ])
}

fn integer_reply(n: usize) -> RespValue {
    RespValue::integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn parse_integer(arg: &Bytes) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

/// Seconds as a float; zero means wait forever.
fn parse_timeout(arg: &Bytes) -> Result<Option<Duration>, CommandError> {
    let secs: f64 = std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|secs: &f64| secs.is_finite())
        .ok_or(CommandError::InvalidTimeout)?;

    if secs < 0.0 {
        return Err(CommandError::NegativeTimeout);
    }
    if secs == 0.0 {
        return Ok(None);
    }

    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| CommandError::InvalidTimeout)
}

fn parse_range_bound(arg: &Bytes, is_start: bool) -> Result<StreamId, CommandError> {
    let s = std::str::from_utf8(arg).map_err(|_| StreamIdError::Invalid)?;
    Ok(StreamId::parse_range_bound(s, is_start)?)
}
