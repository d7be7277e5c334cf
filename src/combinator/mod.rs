//! Combinator Module
//!
//! Defines how two values written to the same key are merged.
//!
//! ## Contract
//! - `combine(first, second)` is called with two *values*; deletions never
//!   reach a combinator (callers decide how a deletion interacts with a
//!   pending value)
//! - No side effects, callable from many threads at once
//! - Commutativity is never assumed: `first` is always the older value
//! - A combinator may refuse a merge; the caller turns that into
//!   `KeystackError::MergeConflict` for the key being written

mod builtin;

use std::sync::Arc;

use thiserror::Error;

use crate::error::{KeystackError, Result};

pub use builtin::{
    ListUnionCombinator, MaxCombinator, OverwriteCombinator, SumCombinator, UniqueCombinator,
};

/// A combinator refused to merge two values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct MergeRefused {
    pub reason: String,
}

impl MergeRefused {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Attach the key the merge was attempted for
    pub fn for_key(self, key: i64) -> KeystackError {
        KeystackError::MergeConflict {
            key,
            reason: self.reason,
        }
    }
}

/// Merges an older and a newer value for the same key
pub trait Combinator<T>: Send + Sync {
    fn combine(&self, first: &T, second: &T) -> std::result::Result<T, MergeRefused>;
}

impl<T, F> Combinator<T> for F
where
    F: Fn(&T, &T) -> std::result::Result<T, MergeRefused> + Send + Sync,
{
    fn combine(&self, first: &T, second: &T) -> std::result::Result<T, MergeRefused> {
        self(first, second)
    }
}

/// Shared handle to a combinator, as held by data interfaces
pub type SharedCombinator<T> = Arc<dyn Combinator<T>>;

/// Apply a write of `incoming` on top of `existing`.
///
/// A deletion always wins; a value over nothing is stored as is; two values
/// go through the combinator.
pub fn apply_write<T: Clone>(
    combinator: &dyn Combinator<T>,
    key: i64,
    existing: Option<&T>,
    incoming: Option<&T>,
) -> Result<Option<T>> {
    match (existing, incoming) {
        (_, None) => Ok(None),
        (None, Some(new)) => Ok(Some(new.clone())),
        (Some(old), Some(new)) => combinator
            .combine(old, new)
            .map(Some)
            .map_err(|refused| refused.for_key(key)),
    }
}
