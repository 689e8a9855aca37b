//! Change detection between a stored snapshot and a new mapping.
//!
//! [`compute_delta`] compares two JSON objects key by key and reports keys
//! that were added, removed, or changed. Unchanged keys are omitted.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::CoreError;

/// How one key's value changed.
///
/// `None` means the key was absent on that side; a stored JSON null is
/// `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

impl Delta {
    pub fn new(previous: Option<Value>, current: Option<Value>) -> Self {
        Delta { previous, current }
    }

    /// True if the key did not exist before.
    pub fn is_added(&self) -> bool {
        self.previous.is_none() && self.current.is_some()
    }

    /// True if the key no longer exists.
    pub fn is_removed(&self) -> bool {
        self.previous.is_some() && self.current.is_none()
    }

    /// True if the key exists on both sides with different values, as
    /// decided by [`values_equal`].
    pub fn is_changed(&self) -> bool {
        matches!((&self.previous, &self.current), (Some(p), Some(c)) if !values_equal(p, c))
    }
}

/// Ordered mapping from key to [`Delta`], with named-field access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaSet(IndexMap<String, Delta>);

impl DeltaSet {
    pub fn new() -> Self {
        DeltaSet(IndexMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, delta: Delta) {
        self.0.insert(key.into(), delta);
    }

    /// Returns the delta for `key`, or [`CoreError::MissingKey`].
    pub fn field(&self, key: &str) -> Result<&Delta, CoreError> {
        self.0.get(key).ok_or_else(|| CoreError::MissingKey {
            key: key.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&Delta> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Delta)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys present now but not before.
    pub fn added(&self) -> impl Iterator<Item = &String> {
        self.0.iter().filter(|(_, d)| d.is_added()).map(|(k, _)| k)
    }

    /// Keys present before but not now.
    pub fn removed(&self) -> impl Iterator<Item = &String> {
        self.0.iter().filter(|(_, d)| d.is_removed()).map(|(k, _)| k)
    }

    /// Keys present on both sides with different values.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.0.iter().filter(|(_, d)| d.is_changed()).map(|(k, _)| k)
    }
}

impl IntoIterator for DeltaSet {
    type Item = (String, Delta);
    type IntoIter = indexmap::map::IntoIter<String, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// JSON equality with numbers compared by value, so `1` equals `1.0`.
///
/// Integers are compared exactly unless one side is a float.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if a.is_f64() || b.is_f64() {
        a.as_f64() == b.as_f64()
    } else {
        a == b
    }
}

/// Compare `previous` against `current`.
///
/// Keys are visited in sorted order so the resulting [`DeltaSet`] is
/// deterministic. Values are compared with [`values_equal`]. Returns an empty
/// set when nothing differs.
pub fn compute_delta(previous: &Map<String, Value>, current: &Map<String, Value>) -> DeltaSet {
    let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();

    let mut deltas = DeltaSet::new();
    for key in keys {
        match (previous.get(key), current.get(key)) {
            (None, Some(c)) => deltas.insert(key.clone(), Delta::new(None, Some(c.clone()))),
            (Some(p), None) => deltas.insert(key.clone(), Delta::new(Some(p.clone()), None)),
            (Some(p), Some(c)) if !values_equal(p, c) => {
                deltas.insert(key.clone(), Delta::new(Some(p.clone()), Some(c.clone())))
            }
            _ => {}
        }
    }
    deltas
}
