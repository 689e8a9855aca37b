//! Value model for the unit key-value store.
//!
//! Stored values are plain JSON ([`Value`]). This crate adds the two
//! read-only views the store hands back to callers:
//!
//! - [`Record`]: named-field access over a stored JSON object
//! - [`Delta`] / [`DeltaSet`]: before/after pairs describing how keys changed

pub mod delta;
pub mod error;
pub mod record;

pub use delta::{compute_delta, values_equal, Delta, DeltaSet};
pub use error::CoreError;
pub use record::Record;

/// The store's value domain: null, bool, number, string, array, object.
pub use serde_json::{Map, Value};
