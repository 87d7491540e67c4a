use std::collections::BTreeMap;

use bytes::Bytes;

/// Any bencode value.
///
/// Dictionaries use a `BTreeMap` keyed by raw bytes, which gives the
/// bytewise key ordering bencode requires for free when re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Int(i64),
    /// A byte string; not necessarily UTF-8.
    Str(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte-string keys.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// A byte-string value from a UTF-8 string.
    pub fn str(s: &str) -> Self {
        Value::Str(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// A byte-string value from a byte slice.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Str(Bytes::copy_from_slice(b))
    }

    /// An empty dictionary, for incremental building.
    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Str(b) => Some(b),
            _ => None,
        }
    }

    /// The value as UTF-8 text, if it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Inserts into this value if it is a dictionary; no-op otherwise.
    pub fn insert(&mut self, key: &'static [u8], value: Value) {
        if let Value::Dict(d) = self {
            d.insert(Bytes::from_static(key), value);
        }
    }

    /// Convenience: `get` then `as_int`.
    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_int()
    }

    /// Convenience: `get` then `as_bytes`.
    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key)?.as_bytes()
    }

    /// Convenience: `get` then `as_str`.
    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key)?.as_str()
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Str(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
