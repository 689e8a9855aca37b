//! Process-wide store handle.
//!
//! The store is opened lazily on first use with [`Storage::from_env`] and
//! reused afterwards. [`reset`] closes it and returns the slot to its
//! unconstructed state, both for test isolation and at process end.
//!
//! Access is exclusive for the duration of a [`with_kv`] closure. Re-entering
//! from inside that closure on the same thread (including from a hook body run
//! by [`crate::with_hook_data`]) fails with [`StorageError::KvInUse`]; code
//! running inside a hook reaches the store through its
//! [`crate::HookContext`].

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::Storage;

static KV: Mutex<Option<Storage>> = Mutex::new(None);

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the slot as held by the current thread until dropped.
struct HeldMarker;

impl HeldMarker {
    fn acquire() -> Result<Self, StorageError> {
        if HELD.with(|held| held.replace(true)) {
            warn!("process-wide store re-entered while in use on this thread");
            return Err(StorageError::KvInUse);
        }
        Ok(HeldMarker)
    }
}

impl Drop for HeldMarker {
    fn drop(&mut self) {
        HELD.with(|held| held.set(false));
    }
}

fn slot() -> MutexGuard<'static, Option<Storage>> {
    // A panic inside `with_kv` leaves the store usable: any open scope was
    // rolled back by its guard while unwinding.
    KV.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` against the process-wide store, opening it on first use.
///
/// Returns [`StorageError::KvInUse`] when called from inside another
/// `with_kv` closure on the same thread.
pub fn with_kv<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce(&mut Storage) -> Result<T, E>,
    E: From<StorageError>,
{
    let _held = HeldMarker::acquire()?;
    let mut slot = slot();
    let store = match slot.take() {
        Some(store) => store,
        None => {
            let store = Storage::from_env()?;
            debug!(path = %store.path(), "process-wide store opened");
            store
        }
    };
    f(slot.insert(store))
}

/// True if the process-wide store has been opened.
///
/// Always answers `true` while the store is in use on the current thread.
pub fn is_initialized() -> bool {
    if HELD.with(Cell::get) {
        return true;
    }
    slot().is_some()
}

/// Closes the process-wide store (rolling back uncommitted work) and clears
/// the slot. The next [`with_kv`] opens a fresh store.
pub fn reset() -> Result<(), StorageError> {
    let _held = HeldMarker::acquire()?;
    let taken = slot().take();
    if let Some(mut store) = taken {
        store.close()?;
        debug!("process-wide store reset");
    }
    Ok(())
}
