//! Environment-derived store configuration.
//!
//! Resolution order for the database location:
//! 1. `UNIT_STATE_DB` names the path explicitly (`:memory:` selects an
//!    in-memory database).
//! 2. `CHARM_HELPERS_TESTMODE` set to a truthy value forces in-memory.
//! 3. `CHARM_DIR` or `JUJU_UNIT_NAME` present means a real deployment:
//!    the file `.unit-state.db` under `CHARM_DIR` (or the current directory).
//! 4. Anything else is in-memory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;
use crate::traits::EnvSource;

/// Explicit database path override.
pub const STATE_DB_VAR: &str = "UNIT_STATE_DB";
/// Busy timeout override in milliseconds.
pub const BUSY_TIMEOUT_VAR: &str = "UNIT_STATE_DB_BUSY_TIMEOUT_MS";
/// Forces a transient store when truthy.
pub const TEST_MODE_VAR: &str = "CHARM_HELPERS_TESTMODE";
/// The charm's working directory.
pub const CHARM_DIR_VAR: &str = "CHARM_DIR";
/// The unit name; present only under a real deployment.
pub const UNIT_NAME_VAR: &str = "JUJU_UNIT_NAME";

/// File name of the persistent store inside the charm directory.
pub const DEFAULT_DB_FILE: &str = ".unit-state.db";
/// SQLite's special name for an in-memory database.
pub const MEMORY_PATH: &str = ":memory:";
/// Default time a writer waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorePath {
    File(PathBuf),
    Memory,
}

impl StorePath {
    /// Interprets `:memory:` as [`StorePath::Memory`], anything else as a file.
    pub fn parse(raw: &str) -> Self {
        if raw == MEMORY_PATH {
            StorePath::Memory
        } else {
            StorePath::File(PathBuf::from(raw))
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StorePath::Memory)
    }

    pub fn as_file(&self) -> Option<&Path> {
        match self {
            StorePath::File(p) => Some(p),
            StorePath::Memory => None,
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorePath::File(p) => write!(f, "{}", p.display()),
            StorePath::Memory => write!(f, "{}", MEMORY_PATH),
        }
    }
}

/// Settings used to open a [`Storage`](crate::storage::Storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: StorePath,
    /// How long a write waits on another connection's lock before the
    /// engine reports the database as busy.
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: StorePath::File(path.into()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn memory() -> Self {
        StoreConfig {
            path: StorePath::Memory,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Applies the default location policy to `env`.
    pub fn resolve(env: &dyn EnvSource) -> Result<Self, StorageError> {
        let path = if let Some(explicit) = env.var(STATE_DB_VAR) {
            StorePath::parse(&explicit)
        } else if env.var(TEST_MODE_VAR).is_some_and(|v| is_truthy(&v)) {
            StorePath::Memory
        } else if env.var(CHARM_DIR_VAR).is_some() || env.var(UNIT_NAME_VAR).is_some() {
            let dir = env.var(CHARM_DIR_VAR).unwrap_or_default();
            StorePath::File(Path::new(&dir).join(DEFAULT_DB_FILE))
        } else {
            StorePath::Memory
        };

        let busy_timeout = match env.var(BUSY_TIMEOUT_VAR) {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| StorageError::InvalidConfig {
                    name: BUSY_TIMEOUT_VAR.to_string(),
                    value: raw,
                })?,
            None => DEFAULT_BUSY_TIMEOUT,
        };

        Ok(StoreConfig { path, busy_timeout })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
