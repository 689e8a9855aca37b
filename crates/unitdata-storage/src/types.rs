//! Storage-layer types for revisions, history, and diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one hook scope.
///
/// The inner `i64` aligns with SQLite's `INTEGER PRIMARY KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The value recorded for a key at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryData {
    /// The JSON serialization exactly as stored.
    Raw(String),
    /// The decoded value.
    Value(Value),
    /// The key was unset during this revision.
    Deleted,
}

/// One row of a key's history, joined with its hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub revision: Revision,
    pub key: String,
    pub data: HistoryData,
    /// Name of the hook that opened the revision.
    pub hook: String,
    /// RFC 3339 UTC timestamp of the revision.
    pub timestamp: String,
}

/// A live `kv` row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRow {
    pub key: String,
    pub data: String,
}

/// A `kv_revisions` row as stored. `data` is `None` for deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRow {
    pub revision: Revision,
    pub key: String,
    pub data: Option<String>,
}

/// Full contents of the live and history tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugDump {
    pub live: Vec<LiveRow>,
    pub revisions: Vec<RevisionRow>,
}
