//! Seams through which the store reads its surroundings.
//!
//! - [`EnvSource`] supplies environment variables to the path policy and to
//!   [`ExecutionEnvironment`](crate::hookdata::ExecutionEnvironment).
//! - [`Clock`] supplies hook-scope timestamps.
//!
//! Both have a process-backed implementation and a fixed one for tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A source of environment variables.
pub trait EnvSource {
    /// Returns the variable's value. Empty values count as unset.
    fn var(&self, name: &str) -> Option<String>;

    /// Returns every variable whose name starts with `prefix`.
    fn vars_with_prefix(&self, prefix: &str) -> BTreeMap<String, String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn vars_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect()
    }
}

/// A fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: BTreeMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        MapEnv::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn vars_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A source of the current UTC time.
///
/// `Send` so a store owning a clock can live in the process-wide slot.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
