//! Opaque payload / channel-identifier carrier.
//!
//! Channel names and message payloads are wrapped in a single
//! reference-counted value type. Reference counting and "free on last
//! release" fall out of `Arc`/`Drop` directly, so there is no separate
//! `duplicate`/`release` pair -- ordinary `Clone`/`Drop` already does the
//! job.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::OnceCell;

/// A channel identifier or message payload.
///
/// Cheap to clone (an `Arc` bump); equality and hashing are by content.
#[derive(Clone, Debug)]
pub enum Value {
    /// A UTF-8 string (channel names, JSON-encoded payloads, textual messages).
    Str(Arc<StrInner>),
    /// An opaque byte string (binary payloads, raw frame bodies).
    Bytes(Arc<[u8]>),
    /// A filter integer, wrapped as a value so filter channels share the
    /// same keyed-collection shape as pub/sub and pattern channels.
    Int(i64),
}

/// Backing storage for `Value::Str`: the string plus its lazily-computed,
/// cached hash.
#[derive(Debug)]
pub struct StrInner {
    s: Box<str>,
    hash: OnceCell<u64>,
}

impl Value {
    /// Wraps a string, freezing it. The hash is computed lazily and cached
    /// on first use.
    pub fn str<S: Into<Box<str>>>(s: S) -> Self {
        Value::Str(Arc::new(StrInner {
            s: s.into(),
            hash: OnceCell::new(),
        }))
    }

    /// Wraps a byte string.
    pub fn bytes<B: Into<Arc<[u8]>>>(b: B) -> Self {
        Value::Bytes(b.into())
    }

    /// Wraps a filter integer.
    pub fn int(v: i64) -> Self {
        Value::Int(v)
    }

    /// True if this value is a string (as opposed to bytes or an integer).
    #[must_use]
    pub fn type_is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    /// Borrowed byte view of the value's content.
    ///
    /// Integers have no byte view (`Value::Int` returns an empty slice):
    /// filter channels are keyed and dispatched entirely in-process as
    /// plain `i64`s and never cross the wire, so there is nothing to
    /// serialize.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Str(inner) => inner.s.as_bytes(),
            Value::Bytes(b) => b,
            Value::Int(_) => &[],
        }
    }

    /// Borrowed string view, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(inner) => Some(&inner.s),
            _ => None,
        }
    }

    /// Content hash. Cached for strings; derived directly from the integer
    /// for numeric values.
    #[must_use]
    pub fn hash(&self) -> u64 {
        match self {
            Value::Str(inner) => *inner.hash.get_or_init(|| {
                let mut hasher = ahash::AHasher::default();
                inner.s.hash(&mut hasher);
                hasher.finish()
            }),
            Value::Bytes(b) => {
                let mut hasher = ahash::AHasher::default();
                b.hash(&mut hasher);
                hasher.finish()
            }
            Value::Int(i) => {
                // derived directly from the integer, not double-hashed through a
                // generic hasher seed, so equal filters always collide predictably.
                *i as u64
            }
        }
    }

    /// JSON-encodes the value. Strings encode as JSON strings, integers as
    /// JSON numbers, byte strings as JSON arrays of bytes.
    #[must_use]
    pub fn json_encode(&self) -> String {
        match self {
            Value::Str(inner) => serde_json::to_string(&*inner.s).unwrap_or_default(),
            Value::Bytes(b) => serde_json::to_string(&**b).unwrap_or_default(),
            Value::Int(i) => i.to_string(),
        }
    }

    /// Attempts to JSON-decode a string value into a richer `Value`
    /// (string or integer). Returns `None` on decode failure; callers keep
    /// the original string value in that case.
    #[must_use]
    pub fn json_decode(raw: &str) -> Option<Value> {
        let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
        match parsed {
            serde_json::Value::String(s) => Some(Value::str(s)),
            serde_json::Value::Number(n) => n.as_i64().map(Value::Int),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a.s == b.s,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash());
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_string_equality_and_hash() {
        let a = Value::str("news");
        let b = Value::str("news");
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_int_vs_string_disjoint() {
        let filter = Value::int(7);
        let channel = Value::str("7");
        assert_ne!(filter, channel);
    }

    #[test]
    fn test_json_roundtrip() {
        let decoded = Value::json_decode("\"hello\"").unwrap();
        assert_eq!(decoded, Value::str("hello"));
        let decoded_num = Value::json_decode("42").unwrap();
        assert_eq!(decoded_num, Value::int(42));
        assert!(Value::json_decode("not json{{").is_none());
    }

    #[test]
    fn test_clone_is_cheap_refcount() {
        let a = Value::str("channel");
        let b = a.clone();
        assert_eq!(a, b);
    }
}
