//! Per-hook bookkeeping on top of the store.
//!
//! [`HookData`] opens one hook scope, records what the unit knows about the
//! current invocation (charm revision, environment, unit, relation id),
//! snapshots configuration and relation data, and hands the caller the
//! scope together with what changed since the previous hook.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use unitdata_core::DeltaSet;

use crate::config::{CHARM_DIR_VAR, UNIT_NAME_VAR};
use crate::error::StorageError;
use crate::scope::HookScope;
use crate::storage::Storage;
use crate::traits::EnvSource;

/// Prefix of the stored configuration snapshot.
pub const CONFIG_PREFIX: &str = "config.";
/// Prefix of the stored relation snapshot.
pub const RELATIONS_PREFIX: &str = "rels.";
/// Key holding every charm revision the unit has run.
pub const CHARM_REVISIONS_KEY: &str = "charm_revisions";

const HOOK_NAME_VAR: &str = "JUJU_HOOK_NAME";
const RELATION_ID_VAR: &str = "JUJU_RELATION_ID";

/// What is known about the current hook invocation.
///
/// Configuration and relation data come from hook tools that live outside
/// this crate, so callers supply them with [`with_config`](Self::with_config)
/// and [`with_relations`](Self::with_relations).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionEnvironment {
    pub hook_name: String,
    pub unit: Option<String>,
    pub relation_id: Option<String>,
    pub charm_dir: Option<PathBuf>,
    /// `JUJU_*` variables and `CHARM_DIR`.
    pub env: BTreeMap<String, String>,
    pub config: Map<String, Value>,
    pub relations: Map<String, Value>,
}

impl ExecutionEnvironment {
    /// Fills the environment-derived fields from `env`.
    ///
    /// The hook name is `JUJU_HOOK_NAME`, falling back to the file name of
    /// the running program.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let mut snapshot = env.vars_with_prefix("JUJU_");
        let charm_dir = env.var(CHARM_DIR_VAR);
        if let Some(dir) = &charm_dir {
            snapshot.insert(CHARM_DIR_VAR.to_string(), dir.clone());
        }

        ExecutionEnvironment {
            hook_name: env.var(HOOK_NAME_VAR).unwrap_or_else(program_file_name),
            unit: env.var(UNIT_NAME_VAR),
            relation_id: env.var(RELATION_ID_VAR),
            charm_dir: charm_dir.map(PathBuf::from),
            env: snapshot,
            config: Map::new(),
            relations: Map::new(),
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_relations(mut self, relations: Map<String, Value>) -> Self {
        self.relations = relations;
        self
    }
}

/// What a hook body sees while its scope is open.
pub struct HookContext<'s, 'a> {
    /// The open scope; reads and writes go through it.
    pub store: &'s mut HookScope<'a>,
    /// Configuration changes since the previous hook.
    pub config: DeltaSet,
    /// Relation data changes since the previous hook.
    pub relations: DeltaSet,
}

impl HookContext<'_, '_> {
    /// True if configuration key `key` changed since the previous hook.
    pub fn config_changed(&self, key: &str) -> bool {
        self.config.contains(key)
    }
}

/// Runs hook bodies inside a bookkept hook scope.
#[derive(Debug, Clone)]
pub struct HookData {
    env: ExecutionEnvironment,
}

impl HookData {
    pub fn new(env: ExecutionEnvironment) -> Self {
        HookData { env }
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.env
    }

    /// Opens one hook scope on `store`, records this invocation, and runs
    /// `f`. Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn run<T, E, F>(&self, store: &mut Storage, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut HookContext<'_, '_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        store.hook_scope(&self.env.hook_name, |scope| {
            if let Some(dir) = &self.env.charm_dir {
                record_charm_revision(scope, dir)?;
            }
            let (config, relations) = record_hook(scope, &self.env)?;
            let mut ctx = HookContext {
                store: scope,
                config,
                relations,
            };
            f(&mut ctx)
        })
    }
}

/// [`HookData::run`] against the process-wide store.
///
/// The hook body must use `ctx.store`; calling [`crate::with_kv`] from inside
/// it returns [`StorageError::KvInUse`].
pub fn with_hook_data<T, E, F>(env: ExecutionEnvironment, f: F) -> Result<T, E>
where
    F: FnOnce(&mut HookContext<'_, '_>) -> Result<T, E>,
    E: From<StorageError>,
{
    let hook_data = HookData::new(env);
    crate::kv::with_kv(|store| hook_data.run(store, f))
}

/// Appends the charm's revision to `charm_revisions` if not seen before.
///
/// A missing or empty `revision` file counts as revision `"0"`.
fn record_charm_revision(store: &mut Storage, charm_dir: &Path) -> Result<(), StorageError> {
    let revision = match std::fs::read_to_string(charm_dir.join("revision")) {
        Ok(contents) => contents.trim().to_string(),
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    let revision = if revision.is_empty() {
        "0".to_string()
    } else {
        revision
    };

    let mut seen: Vec<String> = store.get_as(CHARM_REVISIONS_KEY)?.unwrap_or_default();
    if !seen.contains(&revision) {
        debug!(revision = %revision, "recording new charm revision");
        seen.push(revision);
        store.set(CHARM_REVISIONS_KEY, &seen)?;
    }
    Ok(())
}

/// Snapshots config and relation data and writes the invocation identity.
fn record_hook(
    store: &mut Storage,
    env: &ExecutionEnvironment,
) -> Result<(DeltaSet, DeltaSet), StorageError> {
    let config = snapshot(store, &env.config, CONFIG_PREFIX)?;
    let relations = snapshot(store, &env.relations, RELATIONS_PREFIX)?;
    store.set("env", &env.env)?;
    store.set("unit", &env.unit)?;
    store.set("relid", &env.relation_id)?;
    Ok((config, relations))
}

/// Diffs `current` against the stored snapshot under `prefix`, then makes
/// `current` the stored snapshot.
fn snapshot(
    store: &mut Storage,
    current: &Map<String, Value>,
    prefix: &str,
) -> Result<DeltaSet, StorageError> {
    let Some(deltas) = store.delta(current, prefix)? else {
        return Ok(DeltaSet::new());
    };
    let removed: Vec<&str> = deltas.removed().map(String::as_str).collect();
    store.unsetrange(Some(removed.as_slice()), prefix)?;
    store.update(current, prefix)?;
    Ok(deltas)
}

fn program_file_name() -> String {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}
