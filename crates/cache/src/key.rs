//! Canonical cache keys.
//!
//! A key is the operation name followed by `?` and the canonical JSON
//! encoding of the arguments: object keys sorted at every depth, no
//! whitespace. Two argument sets that differ only in insertion order encode
//! to the same key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// Separator between the operation name and the encoded arguments.
pub const OPERATION_SEPARATOR: char = '?';

/// Named arguments of a logical operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Arguments from a JSON object. Any other JSON value yields `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(map.into()),
            _ => None,
        }
    }

    /// The arguments as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Canonical encoding: sorted keys at every depth, compact.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(16 * self.0.len() + 2);
        out.push('{');
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_string(&mut out, name);
            out.push(':');
            write_canonical(&mut out, value);
        }
        out.push('}');
        out
    }
}

impl From<Map<String, Value>> for Arguments {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn write_string(out: &mut String, s: &str) {
    // Value's Display emits valid escaped JSON.
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, inner)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, name);
                out.push(':');
                write_canonical(out, inner);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, inner) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, inner);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Deterministic identity of a (operation, arguments) request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(operation: &str, arguments: &Arguments) -> Self {
        let canonical = arguments.canonical();
        let mut key = String::with_capacity(operation.len() + 1 + canonical.len());
        key.push_str(operation);
        key.push(OPERATION_SEPARATOR);
        key.push_str(&canonical);
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The operation part of the key.
    pub fn operation(&self) -> &str {
        self.0
            .split_once(OPERATION_SEPARATOR)
            .map(|(op, _)| op)
            .unwrap_or(&self.0)
    }

    /// Prefix matching used by coarse invalidation.
    ///
    /// Matching is on the raw key text, so `"list-hosts"` matches every
    /// argument set of `list-hosts` and also `list-hosts-by-group`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
