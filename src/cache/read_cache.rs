//! Bounded read cache
//!
//! Sharded `HashMap<i64, Option<T>>`, one RwLock per shard. `None` values
//! remember confirmed absence.
//!
//! A generation counter guards against stale fills: a reader captures the
//! generation before going to the backend and its insert is dropped if the
//! cache was cleared in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::interface::Value;

const READ_CACHE_SHARDS: usize = 32;

pub(crate) struct ReadCache<T> {
    shards: Box<[RwLock<HashMap<i64, Option<T>>>]>,
    shard_capacity: usize,
    generation: AtomicU64,
    len: AtomicUsize,
}

impl<T: Value> ReadCache<T> {
    pub fn new(capacity: usize) -> Self {
        let shard_capacity = capacity.div_ceil(READ_CACHE_SHARDS);
        Self {
            shards: (0..READ_CACHE_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            shard_capacity,
            generation: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: i64) -> &RwLock<HashMap<i64, Option<T>>> {
        &self.shards[key.rem_euclid(READ_CACHE_SHARDS as i64) as usize]
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.shard_capacity * READ_CACHE_SHARDS
    }

    /// `None` on a miss, `Some(None)` for a cached absence
    pub fn get(&self, key: i64) -> Option<Option<T>> {
        self.shard(key).read().get(&key).cloned()
    }

    /// Insert or replace, evicting an arbitrary entry when the shard is full.
    /// Returns false if the cache was cleared since `generation`.
    pub fn insert(&self, key: i64, value: Option<T>, generation: u64) -> bool {
        self.insert_with(key, value, generation, true)
    }

    /// Insert unless the key is already cached
    pub fn insert_if_absent(&self, key: i64, value: Option<T>, generation: u64) -> bool {
        self.insert_with(key, value, generation, false)
    }

    fn insert_with(&self, key: i64, value: Option<T>, generation: u64, replace: bool) -> bool {
        if self.shard_capacity == 0 {
            return false;
        }
        let mut shard = self.shard(key).write();
        if self.generation() != generation {
            return false;
        }

        if let Some(slot) = shard.get_mut(&key) {
            if replace {
                *slot = value;
            }
            return replace;
        }

        if shard.len() >= self.shard_capacity {
            if let Some(&victim) = shard.keys().next() {
                shard.remove(&victim);
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
        }
        shard.insert(key, value);
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop everything; in-flight fills from before the call are rejected.
    /// Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            removed += shard.len();
            shard.clear();
        }
        self.len.fetch_sub(removed, Ordering::Relaxed);
        removed
    }
}
