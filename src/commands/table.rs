//! Static command table.
//!
//! Every supported command has one [`CommandSpec`] describing its name, how
//! many tokens it accepts and which handler serves it. Lookup is by
//! case-insensitive name.

/// Accepted token count, the command name included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(self, argc: usize) -> bool {
        match self {
            Arity::Exact(n) => argc == n,
            Arity::AtLeast(n) => argc >= n,
            Arity::Between(min, max) => (min..=max).contains(&argc),
        }
    }
}

/// Handler selector for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    Echo,
    Set,
    Get,
    Type,
    LPush,
    RPush,
    LPop,
    RPop,
    LLen,
    LRange,
    BLPop,
    XAdd,
    XRange,
    XLen,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Lowercase name, as used in error replies
    pub name: &'static str,
    pub arity: Arity,
    pub kind: CommandKind,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "ping", arity: Arity::Between(1, 2), kind: CommandKind::Ping },
    CommandSpec { name: "echo", arity: Arity::Exact(2), kind: CommandKind::Echo },
    CommandSpec { name: "set", arity: Arity::AtLeast(3), kind: CommandKind::Set },
    CommandSpec { name: "get", arity: Arity::Exact(2), kind: CommandKind::Get },
    CommandSpec { name: "type", arity: Arity::Exact(2), kind: CommandKind::Type },
    CommandSpec { name: "lpush", arity: Arity::AtLeast(3), kind: CommandKind::LPush },
    CommandSpec { name: "rpush", arity: Arity::AtLeast(3), kind: CommandKind::RPush },
    CommandSpec { name: "lpop", arity: Arity::Between(2, 3), kind: CommandKind::LPop },
    CommandSpec { name: "rpop", arity: Arity::Between(2, 3), kind: CommandKind::RPop },
    CommandSpec { name: "llen", arity: Arity::Exact(2), kind: CommandKind::LLen },
    CommandSpec { name: "lrange", arity: Arity::Exact(4), kind: CommandKind::LRange },
    CommandSpec { name: "blpop", arity: Arity::AtLeast(3), kind: CommandKind::BLPop },
    CommandSpec { name: "xadd", arity: Arity::AtLeast(5), kind: CommandKind::XAdd },
    CommandSpec { name: "xrange", arity: Arity::AtLeast(4), kind: CommandKind::XRange },
    CommandSpec { name: "xlen", arity: Arity::Exact(2), kind: CommandKind::XLen },
];

/// Finds the table entry for a command name, ignoring ASCII case.
pub fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name.as_bytes().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        assert_eq!(lookup(b"GET").map(|s| s.kind), Some(CommandKind::Get));
        assert_eq!(lookup(b"bLpOp").map(|s| s.kind), Some(CommandKind::BLPop));
        assert!(lookup(b"FLUSHALL").is_none());
        assert!(lookup(b"").is_none());
    }

    #[test]
    fn test_arity() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(3));
        assert!(Arity::AtLeast(3).accepts(10));
        assert!(!Arity::AtLeast(3).accepts(2));
        assert!(Arity::Between(1, 2).accepts(1));
        assert!(Arity::Between(1, 2).accepts(2));
        assert!(!Arity::Between(1, 2).accepts(3));
    }

    #[test]
    fn test_names_are_unique_and_lowercase() {
        for (i, spec) in COMMANDS.iter().enumerate() {
            assert_eq!(spec.name, spec.name.to_ascii_lowercase());
            assert!(COMMANDS[i + 1..].iter().all(|other| other.name != spec.name));
        }
    }
}
