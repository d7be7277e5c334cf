//! Data Interface Module
//!
//! The one contract shared by storage backends and by the layers that
//! decorate them.
//!
//! ## Layering
//! ```text
//!   client
//!     │
//!     ▼
//! ┌──────────────────────┐
//! │ CachedDataInterface  │  read cache + sharded write buffer
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │ BloomFilterDataInt.  │  "definitely absent" short-circuit
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │ backend              │  memory map, snapshot file, ...
//! └──────────────────────┘
//! ```
//! Every box implements [`DataInterface`] and holds the box below it as an
//! `Arc<dyn DataInterface<T>>`, so the two layers stack in either order.

use std::collections::BTreeSet;

use crate::error::Result;

/// Bound shared by every value type stored in a data interface
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Immutable key/value pair. `value == None` means deletion (when written)
/// or observed absence (when read).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue<T> {
    pub key: i64,
    pub value: Option<T>,
}

impl<T> KeyValue<T> {
    pub fn new(key: i64, value: Option<T>) -> Self {
        Self { key, value }
    }

    /// A pair carrying a value
    pub fn some(key: i64, value: T) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// A deletion marker
    pub fn deletion(key: i64) -> Self {
        Self { key, value: None }
    }
}

/// Ordered stream produced by a data interface. Dropping the stream closes it.
pub type DataStream<I> = Box<dyn Iterator<Item = Result<I>> + Send>;

/// Backend contract (read/write/iterate/flush/drop/close)
///
/// All methods take `&self`: implementations synchronize internally so one
/// instance can be shared across threads behind an `Arc`.
pub trait DataInterface<T: Value>: Send + Sync {
    /// Namespace name, used for logging and to key persisted side data
    fn name(&self) -> &str;

    /// Read the current value of `key`
    fn read(&self, key: i64) -> Result<Option<T>>;

    /// Write `value` for `key`, combining with the existing value.
    /// `None` deletes the key.
    fn write(&self, key: i64, value: Option<T>) -> Result<()>;

    /// Batch write, applied in order with the same semantics as `write`.
    ///
    /// A merge conflict on one key does not stop the remaining entries; the
    /// first conflict is returned after the whole batch has been applied.
    /// Any other error aborts the batch.
    fn write_all(&self, entries: Vec<KeyValue<T>>) -> Result<()> {
        let mut first_conflict = None;
        for entry in entries {
            match self.write(entry.key, entry.value) {
                Ok(()) => {}
                Err(e) if e.is_merge_conflict() => {
                    first_conflict.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first_conflict.map_or(Ok(()), Err)
    }

    /// All present values in ascending key order
    fn iter(&self) -> Result<DataStream<KeyValue<T>>>;

    /// All present keys in ascending order
    fn key_iter(&self) -> Result<DataStream<i64>>;

    /// Present values for exactly the given keys; absent keys are skipped.
    /// Backends return them in ascending key order, layers may serve
    /// in-memory hits ahead of the rest.
    fn iter_keys(&self, keys: &BTreeSet<i64>) -> Result<DataStream<KeyValue<T>>> {
        let mut found = Vec::new();
        for &key in keys {
            if let Some(value) = self.read(key)? {
                found.push(Ok(KeyValue::some(key, value)));
            }
        }
        Ok(Box::new(found.into_iter()))
    }

    /// Advisory compaction hint; may be a no-op
    fn optimize_for_reading(&self) -> Result<()> {
        Ok(())
    }

    /// Visibility/durability barrier
    fn flush(&self) -> Result<()>;

    /// Irreversibly remove all data, leaving an empty interface in place
    fn drop_all_data(&self) -> Result<()>;

    /// Fast, approximate number of keys
    fn appr_size(&self) -> u64;

    /// Exact number of keys; may be O(n)
    fn exact_size(&self) -> Result<u64>;

    /// Release resources. Idempotent.
    fn close(&self) -> Result<()>;
}
