//! Typed reply decoders.
//!
//! Total functions from [`Value`] to concrete types. An absent key
//! (`Value::Nil`) decodes to [`Error::NilReply`] so callers can tell it
//! apart from transport errors; the `opt_*` variants map it to `None`
//! instead. Server error replies decode to [`Error::ServerError`].

use bytes::Bytes;

use blockio_common::{Error, Result};

use crate::resp::Value;

fn wrong_type(expected: &'static str, value: &Value) -> Error {
    Error::WrongType {
        expected,
        actual: value.kind(),
    }
}

/// Decode a bulk reply
pub fn bytes(value: Value) -> Result<Bytes> {
    match value {
        Value::Data(data) => Ok(data),
        Value::Nil => Err(Error::NilReply),
        Value::Error(msg) => Err(Error::ServerError(msg)),
        other => Err(wrong_type("data", &other)),
    }
}

/// Decode a bulk reply, mapping an absent key to `None`
pub fn opt_bytes(value: Value) -> Result<Option<Bytes>> {
    match bytes(value) {
        Ok(data) => Ok(Some(data)),
        Err(Error::NilReply) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Decode a status or bulk reply as a string
pub fn string(value: Value) -> Result<String> {
    match value {
        Value::Status(s) => Ok(s),
        Value::Data(data) => String::from_utf8(data.to_vec())
            .map_err(|_| Error::protocol("bulk reply is not valid utf-8")),
        Value::Nil => Err(Error::NilReply),
        Value::Error(msg) => Err(Error::ServerError(msg)),
        other => Err(wrong_type("string", &other)),
    }
}

/// Decode an integer reply; bulk replies are parsed as decimal
pub fn int(value: Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(i),
        Value::Data(data) => std::str::from_utf8(&data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::protocol("bulk reply is not a decimal integer")),
        Value::Nil => Err(Error::NilReply),
        Value::Error(msg) => Err(Error::ServerError(msg)),
        other => Err(wrong_type("int", &other)),
    }
}

/// Decode a non-negative integer reply
pub fn uint(value: Value) -> Result<u64> {
    let i = int(value)?;
    u64::try_from(i).map_err(|_| Error::protocol(format!("integer reply {i} is negative")))
}

/// Decode an integer reply as a flag (`0` / `1`)
pub fn boolean(value: Value) -> Result<bool> {
    Ok(int(value)? != 0)
}

/// Decode a multi-bulk reply into its items
pub fn values(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Nil => Err(Error::NilReply),
        Value::Error(msg) => Err(Error::ServerError(msg)),
        other => Err(wrong_type("array", &other)),
    }
}
