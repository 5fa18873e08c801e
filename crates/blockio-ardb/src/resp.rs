//! RESP wire codec.
//!
//! Encoding and decoding for the Redis serialization protocol spoken by
//! ARDB servers. Requests are arrays of bulk strings; replies are one of
//! the five RESP reply kinds, modeled as [`Value`].
//!
//! The value reader and writer are both exposed: the client reads values
//! and writes commands, the in-memory stub server used by the tests does
//! the reverse.

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use blockio_common::{Error, Result};

use crate::command::Command;

/// Upper bound on a single bulk payload (guards against a corrupt length
/// prefix allocating unbounded memory). Large enough for any block plus
/// framing.
pub const MAX_BULK_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on array arity, same rationale as [`MAX_BULK_SIZE`].
pub const MAX_ARRAY_SIZE: usize = 1024 * 1024;

/// A decoded RESP reply.
///
/// Server `-ERR` replies are values, not transport errors, so the replies
/// of a pipelined batch stay aligned with the submitted actions; the typed
/// decoders in [`crate::decode`] turn them into errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Absent key or field (`$-1` / `*-1`)
    Nil,
    /// Simple status string, e.g. `+OK`
    Status(String),
    /// Integer reply
    Int(i64),
    /// Bulk payload
    Data(Bytes),
    /// Multi-bulk reply
    Array(Vec<Value>),
    /// Server-side error reply
    Error(String),
}

impl Value {
    /// Reply kind name, used in decode error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Status(_) => "status",
            Self::Int(_) => "int",
            Self::Data(_) => "data",
            Self::Array(_) => "array",
            Self::Error(_) => "error",
        }
    }
}

/// Append the wire encoding of a command to `buf`.
pub fn encode_command(command: &Command, buf: &mut Vec<u8>) {
    let args = command.args();
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Append the wire encoding of a reply value to `buf`.
pub fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Nil => buf.extend_from_slice(b"$-1\r\n"),
        Value::Status(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Value::Int(i) => {
            buf.extend_from_slice(format!(":{i}\r\n").as_bytes());
        }
        Value::Data(data) => {
            buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Value::Array(items) => {
            buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
        Value::Error(msg) => {
            buf.push(b'-');
            buf.extend_from_slice(msg.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// Read one CRLF-terminated line, without the terminator.
async fn read_line<R: AsyncBufRead + Unpin + Send>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-reply",
        )
        .into());
    }
    if line.len() < 2 || line[line.len() - 2] != b'\r' {
        return Err(Error::protocol("line is not CRLF-terminated"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol(format!("invalid integer {:?}", String::from_utf8_lossy(digits))))
}

/// Read one RESP value from the stream.
///
/// Returned as a boxed future because multi-bulk replies recurse.
pub fn read_value<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<Value>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let Some((&tag, rest)) = line.split_first() else {
            return Err(Error::protocol("empty reply line"));
        };
        match tag {
            b'+' => Ok(Value::Status(String::from_utf8_lossy(rest).into_owned())),
            b'-' => Ok(Value::Error(String::from_utf8_lossy(rest).into_owned())),
            b':' => Ok(Value::Int(parse_int(rest)?)),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let len = len as usize;
                if len > MAX_BULK_SIZE {
                    return Err(Error::protocol(format!("bulk payload of {len} bytes exceeds limit")));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf).await?;
                if crlf != *b"\r\n" {
                    return Err(Error::protocol("bulk payload is not CRLF-terminated"));
                }
                Ok(Value::Data(Bytes::from(payload)))
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let len = len as usize;
                if len > MAX_ARRAY_SIZE {
                    return Err(Error::protocol(format!("array of {len} items exceeds limit")));
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(read_value(reader).await?);
                }
                Ok(Value::Array(items))
            }
            other => Err(Error::protocol(format!("unknown reply tag {:?}", other as char))),
        }
    })
}
