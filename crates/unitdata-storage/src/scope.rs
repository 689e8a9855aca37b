//! Hook-scope guard.
//!
//! A [`HookScope`] owns the store's open transaction for the lifetime of one
//! hook. It dereferences to the [`Storage`] so reads and writes go through
//! it directly, and writes made through it are recorded under its revision.
//!
//! Exit paths:
//! - [`HookScope::commit`] commits and clears the revision.
//! - [`HookScope::rollback`], or dropping the guard (including while
//!   unwinding from a panic), rolls back and clears the revision.
//! - [`HookScope::detach`] leaves the transaction and revision in place; the
//!   caller finishes it with [`Storage::flush`].

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::Storage;
use crate::types::Revision;

/// An active hook scope. See the module docs for exit behavior.
#[derive(Debug)]
#[must_use = "dropping a hook scope rolls it back"]
pub struct HookScope<'a> {
    store: &'a mut Storage,
    revision: Revision,
    finished: bool,
}

impl<'a> HookScope<'a> {
    pub(crate) fn new(store: &'a mut Storage, revision: Revision) -> Self {
        HookScope {
            store,
            revision,
            finished: false,
        }
    }

    /// The revision writes in this scope are recorded under.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Commits everything written in the scope.
    pub fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.commit_scope()?;
        debug!(revision = %self.revision, "hook scope committed");
        Ok(())
    }

    /// Discards everything written in the scope.
    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.flush(false)?;
        debug!(revision = %self.revision, "hook scope rolled back");
        Ok(())
    }

    /// Leaves the scope open without commit-or-rollback on exit.
    ///
    /// The revision stays active on the store and the transaction stays
    /// open until the caller calls [`Storage::flush`].
    pub fn detach(mut self) -> Revision {
        self.finished = true;
        debug!(revision = %self.revision, "hook scope detached");
        self.revision
    }
}

impl Deref for HookScope<'_> {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        self.store
    }
}

impl DerefMut for HookScope<'_> {
    fn deref_mut(&mut self) -> &mut Storage {
        self.store
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.store.flush(false) {
            Ok(()) => debug!(revision = %self.revision, "hook scope dropped, rolled back"),
            Err(err) => warn!(revision = %self.revision, error = %err, "hook scope rollback failed"),
        }
    }
}
