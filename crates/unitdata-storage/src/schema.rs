//! SQL schema and connection setup for the store.
//!
//! Uses `rusqlite_migration` to manage schema migrations via SQLite's
//! `user_version` pragma. Migrations are embedded at compile time via
//! `include_str!`.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use tracing::debug;

use crate::error::StorageError;

/// All schema migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(include_str!("migrations/001_initial_schema.sql")),
        // Future migrations added here as new M::up(...) entries.
    ])
}

/// Opens (or creates) the database file at `path` and applies pending
/// migrations.
///
/// The file is created owner-only (0600) before SQLite touches it, since
/// charm state may include secrets. SQLite gives its `-wal`/`-shm` sidecar
/// files the same permissions.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection, StorageError> {
    prepare_file(path)?;
    let mut conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    configure_and_migrate(&mut conn)?;
    debug!(path = %path.display(), "opened unit state database");
    Ok(conn)
}

/// Opens an in-memory database with all migrations applied.
pub fn open_in_memory() -> Result<Connection, StorageError> {
    let mut conn = Connection::open_in_memory()?;
    configure_and_migrate(&mut conn)?;
    debug!("opened in-memory unit state database");
    Ok(conn)
}

#[cfg(unix)]
fn prepare_file(path: &Path) -> Result<(), StorageError> {
    use std::fs::Permissions;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)?;
    // Tighten a pre-existing file too; `mode` only applies on creation.
    file.set_permissions(Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn prepare_file(path: &Path) -> Result<(), StorageError> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Configures pragmas and applies pending migrations.
fn configure_and_migrate(conn: &mut Connection) -> Result<(), StorageError> {
    // WAL lets readers proceed while a hook holds the write lock.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations()
        .to_latest(conn)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(())
}
