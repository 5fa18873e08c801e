//! In-memory RESP server.
//!
//! The ARDB stand-in used by the blockio test suites: a real TCP listener
//! speaking the same RESP subset the data plane uses, backed by in-memory
//! string and hash maps with per-database isolation. State is inspectable
//! so tests can assert on exactly what was written.
//!
//! Not a general-purpose server: unknown commands return an error reply,
//! persistence and expiry do not exist.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use blockio_ardb::resp::{self, Value};
use blockio_common::StorageServerConfig;

const DATABASE_COUNT: usize = 16;

#[derive(Default)]
struct Db {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
}

type SharedState = Arc<Mutex<Vec<Db>>>;

/// A running stub server; dropping it stops the listener.
pub struct StubServer {
    address: String,
    state: SharedState,
    cancel: CancellationToken,
}

impl StubServer {
    /// Bind a fresh server on an ephemeral localhost port.
    ///
    /// # Panics
    ///
    /// Panics when the listener cannot bind; the stub is test tooling.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let address = listener
            .local_addr()
            .expect("stub listener local address")
            .to_string();

        let state: SharedState = Arc::new(Mutex::new(
            (0..DATABASE_COUNT).map(|_| Db::default()).collect(),
        ));
        let cancel = CancellationToken::new();

        let accept_state = state.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        tokio::spawn(serve_connection(
                            stream,
                            accept_state.clone(),
                            accept_cancel.clone(),
                        ));
                    }
                }
            }
        });

        tracing::debug!(address = %address, "stub ARDB server started");
        Self {
            address,
            state,
            cancel,
        }
    }

    /// The listener's `host:port`
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// An online server config pointing at this stub
    #[must_use]
    pub fn server_config(&self) -> StorageServerConfig {
        StorageServerConfig::new(self.address.clone())
    }

    /// Stop accepting and serving connections.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Value of a plain key, if present.
    #[must_use]
    pub fn string_value(&self, database: usize, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock()[database].strings.get(key).cloned()
    }

    /// Value of a hash field, if present.
    #[must_use]
    pub fn hash_field(&self, database: usize, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        self.state.lock()[database]
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    /// Number of fields in a hash; zero when the key is absent.
    #[must_use]
    pub fn hash_len(&self, database: usize, key: &[u8]) -> usize {
        self.state.lock()[database]
            .hashes
            .get(key)
            .map_or(0, HashMap::len)
    }

    /// Total number of keys (strings and hashes) in a database.
    #[must_use]
    pub fn key_count(&self, database: usize) -> usize {
        let state = self.state.lock();
        state[database].strings.len() + state[database].hashes.len()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_connection(stream: TcpStream, state: SharedState, cancel: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let mut current_db = 0usize;
    let mut reply_buf = Vec::new();

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = resp::read_value(&mut reader) => request,
        };
        let Ok(request) = request else {
            // client went away or sent garbage
            return;
        };

        let reply = execute(&state, &mut current_db, request);
        reply_buf.clear();
        resp::encode_value(&reply, &mut reply_buf);
        if writer.write_all(&reply_buf).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

fn execute(state: &SharedState, current_db: &mut usize, request: Value) -> Value {
    let args = match request_args(request) {
        Ok(args) => args,
        Err(reply) => return reply,
    };
    let Some((name, args)) = args.split_first() else {
        return Value::Error("ERR empty command".into());
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();

    match name.as_str() {
        "PING" => Value::Status("PONG".into()),
        "SELECT" => match parse_index(args.first()) {
            Some(index) if index < DATABASE_COUNT => {
                *current_db = index;
                Value::Status("OK".into())
            }
            _ => Value::Error("ERR invalid DB index".into()),
        },
        "FLUSHALL" => {
            let mut dbs = state.lock();
            for db in dbs.iter_mut() {
                db.strings.clear();
                db.hashes.clear();
            }
            Value::Status("OK".into())
        }
        "GET" => {
            let [key] = args else {
                return arity_error("GET");
            };
            let dbs = state.lock();
            let db = &dbs[*current_db];
            if db.hashes.contains_key(key.as_ref()) {
                return wrongtype_error();
            }
            match db.strings.get(key.as_ref()) {
                Some(value) => Value::Data(Bytes::copy_from_slice(value)),
                None => Value::Nil,
            }
        }
        "SET" => {
            let [key, value] = args else {
                return arity_error("SET");
            };
            let mut dbs = state.lock();
            let db = &mut dbs[*current_db];
            db.hashes.remove(key.as_ref());
            db.strings.insert(key.to_vec(), value.to_vec());
            Value::Status("OK".into())
        }
        "DEL" => {
            let mut removed = 0i64;
            let mut dbs = state.lock();
            let db = &mut dbs[*current_db];
            for key in args {
                if db.strings.remove(key.as_ref()).is_some()
                    || db.hashes.remove(key.as_ref()).is_some()
                {
                    removed += 1;
                }
            }
            Value::Int(removed)
        }
        "EXISTS" => {
            let [key] = args else {
                return arity_error("EXISTS");
            };
            let dbs = state.lock();
            let db = &dbs[*current_db];
            let exists =
                db.strings.contains_key(key.as_ref()) || db.hashes.contains_key(key.as_ref());
            Value::Int(exists as i64)
        }
        "INCR" => {
            let [key] = args else {
                return arity_error("INCR");
            };
            let mut dbs = state.lock();
            let db = &mut dbs[*current_db];
            let current = match db.strings.get(key.as_ref()) {
                Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse().ok()) {
                    Some(n) => n,
                    None => return Value::Error("ERR value is not an integer".into()),
                },
                None => 0i64,
            };
            let next = current + 1;
            db.strings
                .insert(key.to_vec(), next.to_string().into_bytes());
            Value::Int(next)
        }
        "HSET" => {
            let [key, field, value] = args else {
                return arity_error("HSET");
            };
            let mut dbs = state.lock();
            let db = &mut dbs[*current_db];
            if db.strings.contains_key(key.as_ref()) {
                return wrongtype_error();
            }
            let fields = db.hashes.entry(key.to_vec()).or_default();
            let created = fields.insert(field.to_vec(), value.to_vec()).is_none();
            Value::Int(created as i64)
        }
        "HGET" => {
            let [key, field] = args else {
                return arity_error("HGET");
            };
            let dbs = state.lock();
            let db = &dbs[*current_db];
            if db.strings.contains_key(key.as_ref()) {
                return wrongtype_error();
            }
            match db
                .hashes
                .get(key.as_ref())
                .and_then(|fields| fields.get(field.as_ref()))
            {
                Some(value) => Value::Data(Bytes::copy_from_slice(value)),
                None => Value::Nil,
            }
        }
        "HDEL" => {
            let Some((key, fields)) = args.split_first() else {
                return arity_error("HDEL");
            };
            let mut dbs = state.lock();
            let db = &mut dbs[*current_db];
            let Some(hash) = db.hashes.get_mut(key.as_ref()) else {
                return Value::Int(0);
            };
            let mut removed = 0i64;
            for field in fields {
                if hash.remove(field.as_ref()).is_some() {
                    removed += 1;
                }
            }
            // deleting the last field deletes the hash key itself
            if hash.is_empty() {
                db.hashes.remove(key.as_ref());
            }
            Value::Int(removed)
        }
        "HKEYS" => {
            let [key] = args else {
                return arity_error("HKEYS");
            };
            let dbs = state.lock();
            let fields = dbs[*current_db]
                .hashes
                .get(key.as_ref())
                .map(|fields| {
                    fields
                        .keys()
                        .map(|field| Value::Data(Bytes::copy_from_slice(field)))
                        .collect()
                })
                .unwrap_or_default();
            Value::Array(fields)
        }
        "HLEN" => {
            let [key] = args else {
                return arity_error("HLEN");
            };
            let dbs = state.lock();
            let len = dbs[*current_db]
                .hashes
                .get(key.as_ref())
                .map_or(0, HashMap::len);
            Value::Int(len as i64)
        }
        other => Value::Error(format!("ERR unknown command '{other}'")),
    }
}

fn request_args(request: Value) -> Result<Vec<Bytes>, Value> {
    let Value::Array(items) = request else {
        return Err(Value::Error("ERR protocol: expected command array".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Data(data) => Ok(data),
            _ => Err(Value::Error(
                "ERR protocol: expected bulk string arguments".into(),
            )),
        })
        .collect()
}

fn parse_index(arg: Option<&Bytes>) -> Option<usize> {
    std::str::from_utf8(arg?).ok()?.parse().ok()
}

fn arity_error(command: &str) -> Value {
    Value::Error(format!("ERR wrong number of arguments for '{command}'"))
}

fn wrongtype_error() -> Value {
    Value::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_ardb::command::{op, Action, Command};
    use blockio_ardb::conn::Connection;
    use blockio_ardb::decode;
    use std::time::Duration;

    async fn connect(server: &StubServer) -> Connection {
        Connection::connect(&server.server_config(), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_string_commands() {
        let server = StubServer::start().await;
        let mut conn = connect(&server).await;

        let reply = conn
            .apply(&Action::Command(Command::new(op::SET).arg("k").arg("v")))
            .await
            .unwrap();
        assert_eq!(decode::string(reply).unwrap(), "OK");

        let reply = conn
            .apply(&Action::Command(Command::new(op::GET).arg("k")))
            .await
            .unwrap();
        assert_eq!(&decode::bytes(reply).unwrap()[..], b"v");

        let reply = conn
            .apply(&Action::Command(Command::new(op::INCR).arg("n")))
            .await
            .unwrap();
        assert_eq!(decode::int(reply).unwrap(), 1);

        assert_eq!(server.string_value(0, b"k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_hash_commands_and_last_field_delete() {
        let server = StubServer::start().await;
        let mut conn = connect(&server).await;

        for field in ["1", "2"] {
            conn.apply(&Action::Command(
                Command::new(op::HSET).arg("h").arg(field).arg("x"),
            ))
            .await
            .unwrap();
        }
        assert_eq!(server.hash_len(0, b"h"), 2);

        for field in ["1", "2"] {
            conn.apply(&Action::Command(
                Command::new(op::HDEL).arg("h").arg(field),
            ))
            .await
            .unwrap();
        }
        // the empty hash key must be gone entirely
        assert_eq!(server.key_count(0), 0);
        let reply = conn
            .apply(&Action::Command(Command::new(op::EXISTS).arg("h")))
            .await
            .unwrap();
        assert!(!decode::boolean(reply).unwrap());
    }

    #[tokio::test]
    async fn test_select_isolates_databases() {
        let server = StubServer::start().await;
        let mut conn = connect(&server).await;

        conn.apply(&Action::Command(Command::new(op::SET).arg("k").arg("db0")))
            .await
            .unwrap();
        conn.apply(&Action::Command(Command::new(op::SELECT).arg(3i64)))
            .await
            .unwrap();
        let reply = conn
            .apply(&Action::Command(Command::new(op::GET).arg("k")))
            .await
            .unwrap();
        assert_eq!(decode::opt_bytes(reply).unwrap(), None);
    }

    #[tokio::test]
    async fn test_pipelined_batch_stays_aligned() {
        let server = StubServer::start().await;
        let mut conn = connect(&server).await;

        let commands: Vec<Command> = (0..16)
            .map(|i| Command::new(op::SET).arg(format!("k{i}")).arg(i as u64))
            .collect();
        conn.apply(&Action::Pipeline(commands)).await.unwrap();

        let reads: Vec<Command> = (0..16)
            .map(|i| Command::new(op::GET).arg(format!("k{i}")))
            .collect();
        let reply = conn.apply(&Action::Pipeline(reads)).await.unwrap();
        let values = decode::values(reply).unwrap();
        for (i, value) in values.into_iter().enumerate() {
            assert_eq!(decode::int(value).unwrap(), i as i64);
        }
    }
}
