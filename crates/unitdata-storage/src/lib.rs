//! Persistent unit state for charm hooks.
//!
//! [`Storage`] is a SQLite-backed key-value store of JSON values. Writes made
//! inside a hook scope commit or roll back together and are recorded in a
//! per-key history tagged with the hook name and a UTC timestamp.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: Revision, history and diagnostic row types
//! - [`traits`]: EnvSource and Clock seams with process and fixed backends
//! - [`config`]: StoreConfig and the default location policy
//! - [`schema`]: SQL schema, migrations and connection setup
//! - [`storage`]: the Storage implementation
//! - [`scope`]: the HookScope guard
//! - [`kv`]: the process-wide store handle
//! - [`hookdata`]: per-hook bookkeeping over a scope

pub mod config;
pub mod error;
pub mod hookdata;
pub mod kv;
pub mod schema;
pub mod scope;
pub mod storage;
pub mod traits;
pub mod types;

// Re-export key types for ergonomic use.
pub use config::{StoreConfig, StorePath};
pub use error::StorageError;
pub use hookdata::{with_hook_data, ExecutionEnvironment, HookContext, HookData};
pub use kv::{reset, with_kv};
pub use scope::HookScope;
pub use storage::Storage;
pub use traits::{Clock, EnvSource, FixedClock, MapEnv, ProcessEnv, SystemClock};
pub use types::{DebugDump, HistoryData, HistoryEntry, Revision};
pub use unitdata_core::{Delta, DeltaSet, Record};
