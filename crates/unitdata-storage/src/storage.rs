//! The unit key-value store.
//!
//! [`Storage`] keeps JSON values in SQLite. Outside a hook scope every write
//! is auto-committed. Inside a scope (see [`crate::scope`]) writes share one
//! immediate transaction and are additionally recorded in `kv_revisions`
//! under the scope's [`Revision`].

use std::io::Write;

use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use unitdata_core::{compute_delta, DeltaSet, Record};

use crate::config::{StoreConfig, StorePath};
use crate::error::StorageError;
use crate::scope::HookScope;
use crate::traits::{Clock, EnvSource, ProcessEnv, SystemClock};
use crate::types::{DebugDump, HistoryData, HistoryEntry, LiveRow, Revision, RevisionRow};

/// Transactional, revisioned key-value store backed by SQLite.
pub struct Storage {
    conn: Option<Connection>,
    path: StorePath,
    revision: Option<Revision>,
    clock: Box<dyn Clock>,
}

impl Storage {
    /// Opens the store described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        Self::open_with_clock(config, Box::new(SystemClock))
    }

    /// Opens the store with a custom timestamp source.
    pub fn open_with_clock(
        config: StoreConfig,
        clock: Box<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let conn = match &config.path {
            StorePath::File(path) => crate::schema::open_database(path, config.busy_timeout)?,
            StorePath::Memory => crate::schema::open_in_memory()?,
        };
        Ok(Storage {
            conn: Some(conn),
            path: config.path,
            revision: None,
            clock,
        })
    }

    /// Opens (or creates) a file-backed store at `path`.
    pub fn open_path(path: impl Into<std::path::PathBuf>) -> Result<Self, StorageError> {
        Self::open(StoreConfig::file(path))
    }

    /// Opens a transient in-memory store.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(StoreConfig::memory())
    }

    /// Opens the store at the location chosen by the default policy applied
    /// to the process environment.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_env_source(&ProcessEnv)
    }

    /// Opens the store at the location chosen by the default policy applied
    /// to `env`.
    pub fn from_env_source(env: &dyn EnvSource) -> Result<Self, StorageError> {
        Self::open(StoreConfig::resolve(env)?)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// The active hook revision, if a scope is open.
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Returns the stored serialization of `key` without decoding it.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Returns the value stored under `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.get_raw(key)? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns the value stored under `key`, or `default` if absent.
    pub fn get_or(&self, key: &str, default: Value) -> Result<Value, StorageError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Decodes the value stored under `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_raw(key)? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns the object stored under `key` as a [`Record`].
    ///
    /// Fails with [`StorageError::NotARecord`] if the value is not an object.
    pub fn get_record(&self, key: &str) -> Result<Option<Record>, StorageError> {
        match self.get(key)? {
            Some(value) => Record::try_from(value).map(Some).map_err(|_| {
                StorageError::NotARecord {
                    key: key.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    /// Returns every key starting with `prefix`, or `None` if there are none.
    ///
    /// The match is a literal, case-sensitive prefix comparison. With `strip`
    /// the prefix is removed from the returned keys.
    pub fn getrange(
        &self,
        prefix: &str,
        strip: bool,
    ) -> Result<Option<Map<String, Value>>, StorageError> {
        let rows = self.range_rows(prefix)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut result = Map::new();
        for (key, data) in rows {
            let value: Value = serde_json::from_str(&data)?;
            let key = if strip {
                key[prefix.len()..].to_string()
            } else {
                key
            };
            result.insert(key, value);
        }
        Ok(Some(result))
    }

    /// Raw `(key, data)` rows under `prefix`, ordered by key.
    fn range_rows(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, data FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
        )?;
        let width = prefix.chars().count() as i64;
        let rows = stmt.query_map(params![prefix, width], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Compares `mapping` with the values stored under `prefix`.
    ///
    /// Returns `None` when nothing differs. Nothing is written; call
    /// [`update`](Self::update) to persist the new state.
    pub fn delta(
        &self,
        mapping: &Map<String, Value>,
        prefix: &str,
    ) -> Result<Option<DeltaSet>, StorageError> {
        let previous = self.getrange(prefix, true)?.unwrap_or_default();
        let deltas = compute_delta(&previous, mapping);
        Ok((!deltas.is_empty()).then_some(deltas))
    }

    /// Every recorded revision of `key`, oldest first.
    ///
    /// Data is returned as stored unless `deserialize` is set.
    pub fn gethistory(
        &self,
        key: &str,
        deserialize: bool,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT r.revision, r.key, r.data, h.hook, h.date
             FROM kv_revisions r
             JOIN hooks h ON r.revision = h.version
             WHERE r.key = ?1
             ORDER BY r.revision",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (revision, key, data, hook, timestamp) = row?;
            let data = match data {
                None => HistoryData::Deleted,
                Some(raw) if deserialize => HistoryData::Value(serde_json::from_str(&raw)?),
                Some(raw) => HistoryData::Raw(raw),
            };
            result.push(HistoryEntry {
                revision: Revision(revision),
                key,
                data,
                hook,
                timestamp,
            });
        }
        Ok(result)
    }

    /// Full contents of the live and history tables.
    pub fn dump(&self) -> Result<DebugDump, StorageError> {
        let conn = self.conn()?;

        let live = {
            let mut stmt = conn.prepare_cached("SELECT key, data FROM kv ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok(LiveRow {
                    key: row.get(0)?,
                    data: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let revisions = {
            let mut stmt = conn.prepare_cached(
                "SELECT revision, key, data FROM kv_revisions ORDER BY revision, key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RevisionRow {
                    revision: Revision(row.get(0)?),
                    key: row.get(1)?,
                    data: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(DebugDump { live, revisions })
    }

    /// Writes [`dump`](Self::dump) to `out` as pretty-printed JSON.
    pub fn debug<W: Write>(&self, out: &mut W) -> Result<(), StorageError> {
        let dump = self.dump()?;
        serde_json::to_writer_pretty(&mut *out, &dump)?;
        writeln!(out)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Stores `value` under `key` and hands it back.
    ///
    /// If the serialization equals what is already stored nothing is
    /// written, not even history. Values go through [`Value`] first so object
    /// keys are always sorted, whatever map type `T` uses. Inside a scope the
    /// value is also recorded for the active revision.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<T, StorageError> {
        let data = serde_json::to_value(&value)?.to_string();

        if self.get_raw(key)?.as_deref() == Some(data.as_str()) {
            trace!(key, "value unchanged, skipping write");
            return Ok(value);
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, data) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data",
            params![key, data],
        )?;
        if let Some(revision) = self.revision {
            conn.execute(
                "INSERT INTO kv_revisions (key, revision, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, revision) DO UPDATE SET data = excluded.data",
                params![key, revision.0, data],
            )?;
        }
        trace!(key, revision = ?self.revision, "stored value");
        Ok(value)
    }

    /// Calls [`set`](Self::set) for every `(prefix + key, value)` pair.
    pub fn update(&mut self, mapping: &Map<String, Value>, prefix: &str) -> Result<(), StorageError> {
        for (key, value) in mapping {
            self.set(&format!("{prefix}{key}"), value)?;
        }
        Ok(())
    }

    /// Removes `key`. Returns whether a live value existed.
    ///
    /// Inside a scope a removed key gets a deletion marker in its history.
    pub fn unset(&mut self, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])? > 0;
        if removed {
            if let Some(revision) = self.revision {
                conn.execute(
                    "INSERT INTO kv_revisions (key, revision, data) VALUES (?1, ?2, NULL)
                     ON CONFLICT(key, revision) DO UPDATE SET data = NULL",
                    params![key, revision.0],
                )?;
            }
            trace!(key, revision = ?self.revision, "removed value");
        }
        Ok(removed)
    }

    /// Removes several keys at once.
    ///
    /// With `Some(keys)` each `prefix + key` is removed; with `None` every
    /// key under `prefix` is. Returns how many live values were removed.
    pub fn unsetrange(&mut self, keys: Option<&[&str]>, prefix: &str) -> Result<usize, StorageError> {
        let targets: Vec<String> = match keys {
            Some(keys) => keys.iter().map(|k| format!("{prefix}{k}")).collect(),
            None => self.range_rows(prefix)?.into_iter().map(|(k, _)| k).collect(),
        };
        let mut removed = 0;
        for key in &targets {
            if self.unset(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Opens a hook scope and returns its guard.
    ///
    /// An empty `name` records the program name instead. The guard commits
    /// on [`HookScope::commit`] and rolls back if dropped uncommitted.
    pub fn begin_hook_scope(&mut self, name: &str) -> Result<HookScope<'_>, StorageError> {
        if let Some(revision) = self.revision {
            return Err(StorageError::ScopeActive { revision });
        }

        let hook = if name.is_empty() {
            program_name()
        } else {
            name.to_string()
        };
        let date = self.clock.now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        if let Err(err) = conn.execute(
            "INSERT INTO hooks (hook, date) VALUES (?1, ?2)",
            params![hook, date],
        ) {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback, "rollback after failed hook insert also failed");
            }
            return Err(err.into());
        }
        let revision = Revision(conn.last_insert_rowid());

        self.revision = Some(revision);
        debug!(%revision, hook = %hook, "hook scope opened");
        Ok(HookScope::new(self, revision))
    }

    /// Runs `f` inside a hook scope.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error when
    /// it returns `Err`. A panic in `f` rolls back as the guard unwinds.
    pub fn hook_scope<T, E, F>(&mut self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut HookScope<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut scope = self.begin_hook_scope(name)?;
        match f(&mut scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = scope.rollback() {
                    warn!(error = %rollback, "hook scope rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Commits the open transaction, or rolls it back when `save` is false.
    ///
    /// Also ends a detached hook scope. A no-op on a closed store or when no
    /// transaction is open.
    pub fn flush(&mut self, save: bool) -> Result<(), StorageError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        self.revision = None;
        if conn.is_autocommit() {
            return Ok(());
        }
        if save {
            conn.execute_batch("COMMIT")?;
            debug!("transaction committed");
        } else {
            conn.execute_batch("ROLLBACK")?;
            debug!("transaction rolled back");
        }
        Ok(())
    }

    /// Rolls back uncommitted work and releases the connection.
    ///
    /// Closing an already closed store does nothing.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.conn.is_none() {
            return Ok(());
        }
        self.flush(false)?;
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| err)?;
            debug!(path = %self.path, "unit state database closed");
        }
        Ok(())
    }

    /// Commits the scope's transaction; on failure rolls back instead.
    pub(crate) fn commit_scope(&mut self) -> Result<(), StorageError> {
        if let Err(err) = self.flush(true) {
            if let Err(rollback) = self.flush(false) {
                warn!(error = %rollback, "rollback after failed commit also failed");
            }
            return Err(err);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("revision", &self.revision)
            .field("closed", &self.conn.is_none())
            .finish()
    }
}

/// Identity of the running program, used as the default hook name.
fn program_name() -> String {
    std::env::args_os()
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::traits::FixedClock;

    fn store() -> Storage {
        Storage::in_memory().unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_get_missing_returns_default() {
        let s = store();
        assert_eq!(s.get("nope").unwrap(), None);
        assert_eq!(s.get_or("nope", json!(42)).unwrap(), json!(42));
    }

    #[test]
    fn test_set_returns_value_and_roundtrips() {
        let mut s = store();
        let value = json!({"a": [1, 2.5, null], "b": "x"});
        let back = s.set("k", value.clone()).unwrap();
        assert_eq!(back, value);
        assert_eq!(s.get("k").unwrap(), Some(value));
        assert_eq!(s.get_raw("k").unwrap().as_deref(), Some(r#"{"a":[1,2.5,null],"b":"x"}"#));
    }

    #[test]
    fn test_stored_null_is_not_missing() {
        let mut s = store();
        s.set("k", Value::Null).unwrap();
        assert_eq!(s.get("k").unwrap(), Some(Value::Null));
        assert_eq!(s.get_or("k", json!(1)).unwrap(), Value::Null);
    }

    #[test]
    fn test_get_as_typed() {
        let mut s = store();
        s.set("ports", vec![80u16, 443]).unwrap();
        let ports: Vec<u16> = s.get_as("ports").unwrap().unwrap();
        assert_eq!(ports, vec![80, 443]);
        assert!(matches!(
            s.get_as::<String>("ports"),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_get_record() {
        let mut s = store();
        s.set("db", json!({"host": "10.0.0.1", "port": 5432})).unwrap();
        let rec = s.get_record("db").unwrap().unwrap();
        assert_eq!(rec.field("port").unwrap(), &json!(5432));
        assert!(rec.field("user").is_err());

        s.set("scalar", 3).unwrap();
        assert!(matches!(
            s.get_record("scalar"),
            Err(StorageError::NotARecord { key }) if key == "scalar"
        ));
        assert!(s.get_record("absent").unwrap().is_none());
    }

    #[test]
    fn test_non_string_map_keys_fail_to_serialize() {
        let mut s = store();
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1);
        assert!(matches!(
            s.set("bad", bad),
            Err(StorageError::Serialization(_))
        ));
        assert_eq!(s.get("bad").unwrap(), None);
    }

    #[test]
    fn test_malformed_stored_json_is_an_error() {
        let s = store();
        s.conn()
            .unwrap()
            .execute("INSERT INTO kv (key, data) VALUES ('k', '{oops')", [])
            .unwrap();
        assert!(matches!(s.get("k"), Err(StorageError::Serialization(_))));
        assert_eq!(s.get_raw("k").unwrap().as_deref(), Some("{oops"));
    }

    #[test]
    fn test_unset() {
        let mut s = store();
        s.set("k", "v").unwrap();
        assert!(s.unset("k").unwrap());
        assert_eq!(s.get_or("k", json!("D")).unwrap(), json!("D"));
        assert!(!s.unset("k").unwrap());
    }

    #[test]
    fn test_update_and_getrange() {
        let mut s = store();
        s.update(&obj(json!({"x": 1, "y": 2})), "g.").unwrap();
        s.set("other", 3).unwrap();

        assert_eq!(
            s.getrange("g.", true).unwrap(),
            Some(obj(json!({"x": 1, "y": 2})))
        );
        assert_eq!(
            s.getrange("g.", false).unwrap(),
            Some(obj(json!({"g.x": 1, "g.y": 2})))
        );
        assert_eq!(s.getrange("missing.", false).unwrap(), None);
    }

    #[test]
    fn test_getrange_prefix_is_literal() {
        let mut s = store();
        s.set("a%b", 1).unwrap();
        s.set("axb", 2).unwrap();
        s.set("A%B", 3).unwrap();
        assert_eq!(s.getrange("a%", false).unwrap(), Some(obj(json!({"a%b": 1}))));
        assert_eq!(s.getrange("a_", false).unwrap(), None);
    }

    #[test]
    fn test_getrange_empty_value_is_present() {
        let mut s = store();
        s.set("p.", "").unwrap();
        assert_eq!(s.getrange("p.", true).unwrap(), Some(obj(json!({"": ""}))));
    }

    #[test]
    fn test_unsetrange() {
        let mut s = store();
        s.update(&obj(json!({"a": 1, "b": 2, "c": 3})), "r.").unwrap();
        assert_eq!(s.unsetrange(Some(&["a", "zz"][..]), "r.").unwrap(), 1);
        assert_eq!(s.getrange("r.", true).unwrap(), Some(obj(json!({"b": 2, "c": 3}))));
        assert_eq!(s.unsetrange(None, "r.").unwrap(), 2);
        assert_eq!(s.getrange("r.", true).unwrap(), None);
    }

    #[test]
    fn test_delta_is_read_only() {
        let mut s = store();
        s.update(&obj(json!({"a": 1, "b": 2})), "p.").unwrap();
        let new = obj(json!({"a": 2, "c": 3}));

        let first = s.delta(&new, "p.").unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.field("a").unwrap().previous, Some(json!(1)));
        assert_eq!(first.field("a").unwrap().current, Some(json!(2)));
        assert_eq!(first.field("b").unwrap().current, None);
        assert_eq!(first.field("c").unwrap().previous, None);

        let second = s.delta(&new, "p.").unwrap().unwrap();
        assert_eq!(first, second);

        s.update(&new, "p.").unwrap();
        s.unsetrange(Some(&["b"][..]), "p.").unwrap();
        assert_eq!(s.delta(&new, "p.").unwrap(), None);
    }

    #[test]
    fn test_delta_against_empty_prefix() {
        let s = store();
        let deltas = s.delta(&obj(json!({"k": true})), "cfg.").unwrap().unwrap();
        assert!(deltas.field("k").unwrap().is_added());
        assert_eq!(s.delta(&Map::new(), "cfg.").unwrap(), None);
    }

    #[test]
    fn test_scope_commit() {
        let mut s = store();
        let rev = s
            .hook_scope("install", |scope| {
                scope.set("a", 1)?;
                Ok::<_, StorageError>(scope.revision())
            })
            .unwrap();
        assert_eq!(rev, Revision(1));
        assert_eq!(s.revision(), None);
        assert_eq!(s.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_scope_rollback_on_error() {
        let mut s = store();
        s.set("a", 0).unwrap();
        let result: Result<(), StorageError> = s.hook_scope("install", |scope| {
            scope.set("a", 1)?;
            scope.set("b", 2)?;
            Err(StorageError::Integrity {
                reason: "hook failed".into(),
            })
        });
        assert!(matches!(result, Err(StorageError::Integrity { .. })));
        assert_eq!(s.revision(), None);
        assert_eq!(s.get("a").unwrap(), Some(json!(0)));
        assert_eq!(s.get("b").unwrap(), None);
        assert!(s.gethistory("a", false).unwrap().is_empty());
    }

    #[test]
    fn test_scope_rollback_on_panic() {
        let mut s = store();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = s.hook_scope("install", |scope| {
                scope.set("a", 1)?;
                if scope.revision().0 > 0 {
                    panic!("hook crashed");
                }
                Ok::<_, StorageError>(())
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(s.revision(), None);
        assert_eq!(s.get("a").unwrap(), None);
    }

    #[test]
    fn test_guard_dropped_without_commit_rolls_back() {
        let mut s = store();
        {
            let mut scope = s.begin_hook_scope("config-changed").unwrap();
            scope.set("a", 1).unwrap();
        }
        assert_eq!(s.revision(), None);
        assert_eq!(s.get("a").unwrap(), None);
    }

    #[test]
    fn test_nested_scope_is_rejected() {
        let mut s = store();
        let mut scope = s.begin_hook_scope("install").unwrap();
        let rev = scope.revision();
        let err = scope.begin_hook_scope("start").unwrap_err();
        assert!(matches!(err, StorageError::ScopeActive { revision } if revision == rev));
        scope.commit().unwrap();
    }

    #[test]
    fn test_detached_scope_requires_flush() {
        let mut s = store();
        let rev = {
            let mut scope = s.begin_hook_scope("upgrade-charm").unwrap();
            scope.set("a", 1).unwrap();
            scope.detach()
        };
        assert_eq!(s.revision(), Some(rev));
        s.set("b", 2).unwrap();
        assert!(matches!(
            s.begin_hook_scope("again"),
            Err(StorageError::ScopeActive { .. })
        ));

        s.flush(true).unwrap();
        assert_eq!(s.revision(), None);
        assert_eq!(s.gethistory("b", false).unwrap().len(), 1);
        assert_eq!(s.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_idempotent_set_writes_single_history_entry() {
        let mut s = store();
        s.hook_scope("install", |scope| {
            scope.set("k", "v")?;
            scope.set("k", "v")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        s.hook_scope("config-changed", |scope| {
            scope.set("k", "v")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        assert_eq!(s.gethistory("k", false).unwrap().len(), 1);
        assert_eq!(s.get("k").unwrap(), Some(json!("v")));
    }

    #[test]
    fn test_equal_hash_maps_write_single_history_entry() {
        let first: std::collections::HashMap<String, i32> =
            (0..16).map(|i| (format!("key-{i}"), i)).collect();
        let second: std::collections::HashMap<String, i32> =
            (0..16).rev().map(|i| (format!("key-{i}"), i)).collect();

        let mut s = store();
        s.hook_scope("install", |scope| {
            scope.set("m", &first)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        s.hook_scope("config-changed", |scope| {
            scope.set("m", &second)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

        assert_eq!(s.gethistory("m", false).unwrap().len(), 1);
        let raw = s.get_raw("m").unwrap().unwrap();
        assert!(raw.starts_with("{\"key-0\":0,\"key-1\":1,\"key-10\":10,"));
    }

    #[test]
    fn test_deleted_string_is_an_ordinary_value() {
        let mut s = store();
        s.hook_scope("install", |scope| {
            scope.set("k", "DELETED")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        let history = s.gethistory("k", true).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data, HistoryData::Value(json!("DELETED")));
        assert_eq!(s.get("k").unwrap(), Some(json!("DELETED")));
    }

    #[test]
    fn test_writes_outside_scope_have_no_history() {
        let mut s = store();
        s.set("k", 1).unwrap();
        s.unset("k").unwrap();
        assert!(s.gethistory("k", false).unwrap().is_empty());
    }

    #[test]
    fn test_history_ordering_and_hook_names() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut s =
            Storage::open_with_clock(StoreConfig::memory(), Box::new(FixedClock(when))).unwrap();

        s.hook_scope("install", |scope| {
            scope.set("x", "one")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        s.hook_scope("config-changed", |scope| {
            scope.set("x", "two")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

        let history = s.gethistory("x", false).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].revision < history[1].revision);
        assert_eq!(history[0].hook, "install");
        assert_eq!(history[1].hook, "config-changed");
        assert_eq!(history[0].data, HistoryData::Raw("\"one\"".into()));
        assert_eq!(history[0].timestamp, "2024-05-01T12:00:00.000000Z");

        let decoded = s.gethistory("x", true).unwrap();
        assert_eq!(decoded[1].data, HistoryData::Value(json!("two")));
    }

    #[test]
    fn test_unset_in_scope_records_deletion() {
        let mut s = store();
        s.hook_scope("install", |scope| {
            scope.set("k", 1)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        s.hook_scope("stop", |scope| {
            scope.unset("k")?;
            // Unsetting a missing key leaves no marker.
            scope.unset("never-set")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

        let history = s.gethistory("k", true).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data, HistoryData::Value(json!(1)));
        assert_eq!(history[1].data, HistoryData::Deleted);
        assert_eq!(history[1].hook, "stop");
        assert!(s.gethistory("never-set", false).unwrap().is_empty());
    }

    #[test]
    fn test_set_then_unset_in_same_scope() {
        let mut s = store();
        s.hook_scope("install", |scope| {
            scope.set("k", 1)?;
            scope.unset("k")?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        let history = s.gethistory("k", false).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data, HistoryData::Deleted);
    }

    #[test]
    fn test_empty_hook_name_uses_program_name() {
        let mut s = store();
        s.hook_scope("", |scope| {
            scope.set("k", 1)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        let history = s.gethistory("k", false).unwrap();
        assert_eq!(history[0].hook, program_name());
        assert!(!history[0].hook.is_empty());
    }

    #[test]
    fn test_flush_without_transaction_is_noop() {
        let mut s = store();
        s.flush(true).unwrap();
        s.flush(false).unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut s = store();
        s.set("k", 1).unwrap();
        s.close().unwrap();
        assert!(s.is_closed());
        s.close().unwrap();
        s.flush(true).unwrap();
        assert!(matches!(s.get("k"), Err(StorageError::Closed)));
        assert!(matches!(s.set("k", 2), Err(StorageError::Closed)));
    }

    #[test]
    fn test_dump_snapshot() {
        let mut s = store();
        s.set("b", "plain").unwrap();
        s.hook_scope("install", |scope| {
            scope.set("a", 1)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
        insta::assert_json_snapshot!(s.dump().unwrap(), @r###"
        {
          "live": [
            {
              "key": "a",
              "data": "1"
            },
            {
              "key": "b",
              "data": "\"plain\""
            }
          ],
          "revisions": [
            {
              "revision": 1,
              "key": "a",
              "data": "1"
            }
          ]
        }
        "###);

        let mut out = Vec::new();
        s.debug(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        let parsed: DebugDump = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.live.len(), 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn json_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(|n| json!(n)),
                "[a-z0-9 ]{0,8}".prop_map(Value::String),
            ];
            leaf.prop_recursive(3, 16, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
        }

        proptest! {
            #[test]
            fn set_then_get_returns_value(key in "[a-z.]{1,12}", value in json_value()) {
                let mut s = store();
                s.set(&key, value.clone()).unwrap();
                prop_assert_eq!(s.get(&key).unwrap(), Some(value));
            }
        }
    }
}
