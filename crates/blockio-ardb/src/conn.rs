//! Connections and dialing.
//!
//! A [`Connection`] is a buffered TCP stream speaking RESP to one ARDB
//! server. Connections are not shared across concurrent operations; the
//! pool hands them out one lease at a time. A connection that observes a
//! transport or protocol error is poisoned and must not be reused.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use blockio_common::{Result, StorageServerConfig};

use crate::command::{op, Action, Command};
use crate::decode;
use crate::resp::{self, Value};

/// Default dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A client connection to one ARDB server
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    address: String,
    database: i64,
    broken: bool,
}

impl Connection {
    /// Dial the configured server, honoring the dial timeout, and select
    /// the configured database when it is not the default.
    ///
    /// # Errors
    ///
    /// A timeout surfaces as a `TimedOut` i/o error; other dial and
    /// handshake failures are returned verbatim.
    pub async fn connect(cfg: &StorageServerConfig, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&cfg.address))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dialing {} timed out after {timeout:?}", cfg.address),
                )
            })??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            address: cfg.address.clone(),
            database: cfg.database,
            broken: false,
        };

        if cfg.database != 0 {
            let reply = conn
                .apply(&Action::Command(
                    Command::new(op::SELECT).arg(cfg.database),
                ))
                .await?;
            decode::string(reply)?;
        }

        tracing::debug!(address = %conn.address, database = conn.database, "connected to ARDB server");
        Ok(conn)
    }

    /// Address this connection was dialed to
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Database selected on this connection
    #[must_use]
    pub fn database(&self) -> i64 {
        self.database
    }

    /// Whether this connection observed a transport or protocol error
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Apply one action on this connection.
    ///
    /// A pipelined action is written with a single flush and its reply is
    /// an array aligned 1:1 with the submitted commands.
    pub async fn apply(&mut self, action: &Action) -> Result<Value> {
        let result = self.apply_inner(action).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Apply a sequence of actions with a single flush, one reply per
    /// action. Used by batched cluster dispatch.
    pub(crate) async fn apply_all(&mut self, actions: &[Action]) -> Result<Vec<Value>> {
        let result = self.apply_all_inner(actions).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn apply_inner(&mut self, action: &Action) -> Result<Value> {
        match action {
            Action::Command(command) => {
                self.send(std::slice::from_ref(command)).await?;
                resp::read_value(&mut self.reader).await
            }
            Action::Pipeline(commands) => {
                if commands.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                self.send(commands).await?;
                let mut replies = Vec::with_capacity(commands.len());
                for _ in commands {
                    replies.push(resp::read_value(&mut self.reader).await?);
                }
                Ok(Value::Array(replies))
            }
        }
    }

    async fn apply_all_inner(&mut self, actions: &[Action]) -> Result<Vec<Value>> {
        let mut buf = Vec::new();
        for action in actions {
            match action {
                Action::Command(command) => resp::encode_command(command, &mut buf),
                Action::Pipeline(commands) => {
                    for command in commands {
                        resp::encode_command(command, &mut buf);
                    }
                }
            }
        }
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        let mut replies = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                Action::Command(_) => replies.push(resp::read_value(&mut self.reader).await?),
                Action::Pipeline(commands) => {
                    let mut inner = Vec::with_capacity(commands.len());
                    for _ in commands {
                        inner.push(resp::read_value(&mut self.reader).await?);
                    }
                    replies.push(Value::Array(inner));
                }
            }
        }
        Ok(replies)
    }

    async fn send(&mut self, commands: &[Command]) -> Result<()> {
        let mut buf = Vec::new();
        for command in commands {
            resp::encode_command(command, &mut buf);
        }
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Establishes connections to storage servers.
///
/// The standard dialer is a value type; callers may supply their own to
/// interpose on connection establishment.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, cfg: &StorageServerConfig) -> Result<Connection>;
}

/// The default TCP dialer
#[derive(Clone, Copy, Debug)]
pub struct StandardDialer {
    pub timeout: Duration,
}

impl Default for StandardDialer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for StandardDialer {
    async fn dial(&self, cfg: &StorageServerConfig) -> Result<Connection> {
        Connection::connect(cfg, self.timeout).await
    }
}
