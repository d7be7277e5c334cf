//! Ordered in-memory store
//!
//! BTreeMap wrapped in RwLock, shared with the streams it hands out.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::combinator::{apply_write, Combinator};
use crate::error::Result;
use crate::interface::{DataStream, KeyValue, Value};

/// Number of entries copied out per read-lock acquisition while streaming
const STREAM_CHUNK: usize = 1024;

/// Ordered map from key to value with chunked, lock-releasing streams
pub(crate) struct OrderedStore<T> {
    data: Arc<RwLock<BTreeMap<i64, T>>>,
}

impl<T: Value> OrderedStore<T> {
    pub fn new() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn from_map(map: BTreeMap<i64, T>) -> Self {
        Self {
            data: Arc::new(RwLock::new(map)),
        }
    }

    pub fn get(&self, key: i64) -> Option<T> {
        self.data.read().get(&key).cloned()
    }

    /// Apply one write under the write lock
    pub fn apply(&self, combinator: &dyn Combinator<T>, key: i64, value: Option<T>) -> Result<()> {
        let mut data = self.data.write();
        Self::apply_locked(&mut data, combinator, key, value)
    }

    /// Apply a batch under a single write lock acquisition.
    ///
    /// Merge conflicts skip the offending entry; the first one is returned
    /// once every entry has been applied.
    pub fn apply_all(
        &self,
        combinator: &dyn Combinator<T>,
        entries: Vec<KeyValue<T>>,
    ) -> Result<()> {
        let mut data = self.data.write();
        let mut first_conflict = None;
        for entry in entries {
            if let Err(e) = Self::apply_locked(&mut data, combinator, entry.key, entry.value) {
                if !e.is_merge_conflict() {
                    return Err(e);
                }
                first_conflict.get_or_insert(e);
            }
        }
        first_conflict.map_or(Ok(()), Err)
    }

    fn apply_locked(
        data: &mut BTreeMap<i64, T>,
        combinator: &dyn Combinator<T>,
        key: i64,
        value: Option<T>,
    ) -> Result<()> {
        match apply_write(combinator, key, data.get(&key), value.as_ref())? {
            Some(merged) => {
                data.insert(key, merged);
            }
            None => {
                data.remove(&key);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Run `f` with the map read-locked (used for snapshots)
    pub fn with_map<R>(&self, f: impl FnOnce(&BTreeMap<i64, T>) -> R) -> R {
        f(&self.data.read())
    }

    pub fn stream(&self) -> DataStream<KeyValue<T>> {
        Box::new(ChunkedStream::new(Arc::clone(&self.data), |k, v| {
            KeyValue::some(*k, v.clone())
        }))
    }

    pub fn key_stream(&self) -> DataStream<i64> {
        Box::new(ChunkedStream::new(Arc::clone(&self.data), |k, _| *k))
    }

    /// Stream the present values of `keys`, in key order
    pub fn keys_stream(&self, keys: &BTreeSet<i64>) -> DataStream<KeyValue<T>> {
        let data = Arc::clone(&self.data);
        let keys: Vec<i64> = keys.iter().copied().collect();
        Box::new(keys.into_iter().filter_map(move |key| {
            data.read()
                .get(&key)
                .map(|value| Ok(KeyValue::some(key, value.clone())))
        }))
    }
}

/// Streams a shared BTreeMap in key order without holding its lock between
/// chunks. Entries written behind the cursor after it passed are not seen;
/// entries ahead of it are.
struct ChunkedStream<T, I> {
    data: Arc<RwLock<BTreeMap<i64, T>>>,
    project: fn(&i64, &T) -> I,
    last_key: Option<i64>,
    buffer: VecDeque<(i64, I)>,
    exhausted: bool,
}

impl<T, I> ChunkedStream<T, I> {
    fn new(data: Arc<RwLock<BTreeMap<i64, T>>>, project: fn(&i64, &T) -> I) -> Self {
        Self {
            data,
            project,
            last_key: None,
            buffer: VecDeque::with_capacity(STREAM_CHUNK),
            exhausted: false,
        }
    }

    fn refill(&mut self) {
        let lower = match self.last_key {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let data = self.data.read();
        for (key, value) in data.range((lower, Bound::Unbounded)).take(STREAM_CHUNK) {
            self.buffer.push_back((*key, (self.project)(key, value)));
        }
        if self.buffer.len() < STREAM_CHUNK {
            self.exhausted = true;
        }
    }
}

impl<T, I> Iterator for ChunkedStream<T, I> {
    type Item = Result<I>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        let (key, item) = self.buffer.pop_front()?;
        self.last_key = Some(key);
        Some(Ok(item))
    }
}
