//! Values carried by deferred cells and resource property maps

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Property map exchanged with resource providers
pub type PropertyMap = BTreeMap<String, Value>;

/// A resolved value
///
/// Serializes to plain JSON; bytes are rendered as a hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(#[serde(serialize_with = "hex_bytes")] Vec<u8>),
    /// Ordered list (the result of `all`)
    List(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl Value {
    /// Borrow the string payload, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the list payload, if this is a list
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short type name used in error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Concatenate parts in the given order.
    ///
    /// Strings, integers and booleans contribute their text form. If any part
    /// is `Bytes` the result is `Bytes`, otherwise it is `Str`.
    ///
    /// # Errors
    /// Returns a message naming the offending part when a part is `Null`, a
    /// list or a map.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Value>) -> Result<Value, String> {
        let mut buf: Vec<u8> = Vec::new();
        let mut binary = false;

        for (position, part) in parts.into_iter().enumerate() {
            match part {
                Value::Str(s) => buf.extend_from_slice(s.as_bytes()),
                Value::Int(i) => buf.extend_from_slice(i.to_string().as_bytes()),
                Value::Bool(b) => buf.extend_from_slice(b.to_string().as_bytes()),
                Value::Bytes(bytes) => {
                    binary = true;
                    buf.extend_from_slice(bytes);
                }
                other => {
                    return Err(format!(
                        "cannot concatenate {} at position {position}",
                        other.type_name()
                    ))
                }
            }
        }

        if binary {
            return Ok(Value::Bytes(buf));
        }
        // Only UTF-8 text was appended above
        String::from_utf8(buf)
            .map(Value::Str)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(bytes) => f.write_str(&hex::encode(bytes)),
            Value::List(_) | Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}
