//! Storage actions and the command vocabulary.
//!
//! A [`Command`] is one request; an [`Action`] is what a cluster
//! dispatches: either a single command or a pipelined batch executed on
//! one connection.

use bytes::Bytes;

use blockio_common::BlockHash;

/// Operation names used by the data plane
pub mod op {
    pub const GET: &str = "GET";
    pub const SET: &str = "SET";
    pub const DEL: &str = "DEL";
    pub const EXISTS: &str = "EXISTS";
    pub const INCR: &str = "INCR";
    pub const HGET: &str = "HGET";
    pub const HSET: &str = "HSET";
    pub const HDEL: &str = "HDEL";
    pub const HKEYS: &str = "HKEYS";
    pub const HLEN: &str = "HLEN";
    pub const SELECT: &str = "SELECT";
    pub const PING: &str = "PING";
    pub const EVALSHA: &str = "EVALSHA";
}

/// A single wire argument
#[derive(Clone, Debug)]
pub struct CommandArg(Bytes);

impl From<&str> for CommandArg {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for CommandArg {
    fn from(s: String) -> Self {
        Self(Bytes::from(s.into_bytes()))
    }
}

impl From<&[u8]> for CommandArg {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl From<Bytes> for CommandArg {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<u64> for CommandArg {
    fn from(n: u64) -> Self {
        Self(Bytes::from(n.to_string().into_bytes()))
    }
}

impl From<i64> for CommandArg {
    fn from(n: i64) -> Self {
        Self(Bytes::from(n.to_string().into_bytes()))
    }
}

impl From<&BlockHash> for CommandArg {
    fn from(hash: &BlockHash) -> Self {
        Self(Bytes::copy_from_slice(hash.as_bytes()))
    }
}

/// One request: an operation name followed by its arguments
#[derive(Clone, Debug)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with the given operation name
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    /// Server-side script dispatch by SHA; the remaining arguments pass
    /// through verbatim via [`Command::arg`], and so does the reply.
    #[must_use]
    pub fn script(sha: &str) -> Self {
        Self::new(op::EVALSHA).arg(sha)
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into().0);
        self
    }

    /// All wire arguments, operation name first
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

/// What a cluster dispatches to one server
#[derive(Clone, Debug)]
pub enum Action {
    /// A single request/response
    Command(Command),
    /// A pipelined batch executed on one connection; the reply is an
    /// array with one entry per command, in submission order.
    Pipeline(Vec<Command>),
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Vec<Command>> for Action {
    fn from(commands: Vec<Command>) -> Self {
        Self::Pipeline(commands)
    }
}
