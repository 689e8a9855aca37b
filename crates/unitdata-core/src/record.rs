//! Read-only named-field view over a stored JSON object.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// A read-only view over a JSON object with named-field access.
///
/// Unknown fields are reported as [`CoreError::MissingKey`] rather than
/// silently yielding `null`, so a typo in a field name fails loudly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wraps an existing JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Record(fields)
    }

    /// Returns the named field, or [`CoreError::MissingKey`].
    pub fn field(&self, name: &str) -> Result<&Value, CoreError> {
        self.0.get(name).ok_or_else(|| CoreError::MissingKey {
            key: name.to_string(),
        })
    }

    /// Returns a nested object field as its own [`Record`].
    ///
    /// A field that exists but is not an object is reported as missing.
    pub fn record(&self, name: &str) -> Result<Record, CoreError> {
        match self.field(name)? {
            Value::Object(map) => Ok(Record(map.clone())),
            _ => Err(CoreError::MissingKey {
                key: name.to_string(),
            }),
        }
    }

    /// Returns the named field if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrows the underlying object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Unwraps into the underlying object.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl TryFrom<Value> for Record {
    type Error = Value;

    /// Succeeds for JSON objects; any other value is handed back unchanged.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Record(map)),
            other => Err(other),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}
