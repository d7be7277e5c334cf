//! Sharded write buffer
//!
//! Each shard owns one pending-writes map behind its own mutex. Flushing
//! swaps the map for an empty one ("flip") and writes the old map out
//! without holding the lock, so writers only ever wait for the swap.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::combinator::Combinator;
use crate::error::Result;
use crate::interface::{KeyValue, Value};

/// Coalesced writes for one key, not yet handed to the backend
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingWrite<T> {
    /// The key must be deleted before `value` is written, so the value is
    /// not combined with what the deletion removed
    delete_first: bool,
    /// `None` means the key ends up deleted
    value: Option<T>,
}

impl<T: Value> PendingWrite<T> {
    fn new(value: Option<T>) -> Self {
        Self {
            delete_first: false,
            value,
        }
    }

    /// Combine `newer` on top of `self`
    fn then(
        self,
        newer: PendingWrite<T>,
        combinator: &dyn Combinator<T>,
        key: i64,
    ) -> Result<PendingWrite<T>> {
        if newer.delete_first || newer.value.is_none() {
            return Ok(newer);
        }
        let Some(incoming) = newer.value else {
            return Ok(self);
        };
        match self.value {
            Some(existing) => {
                let merged = combinator
                    .combine(&existing, &incoming)
                    .map_err(|refused| refused.for_key(key))?;
                Ok(PendingWrite {
                    delete_first: self.delete_first,
                    value: Some(merged),
                })
            }
            None => Ok(PendingWrite {
                delete_first: true,
                value: Some(incoming),
            }),
        }
    }

    /// Backend writes reproducing this pending state
    pub fn push_entries(&self, key: i64, out: &mut Vec<KeyValue<T>>) {
        if self.delete_first && self.value.is_some() {
            out.push(KeyValue::deletion(key));
        }
        out.push(KeyValue::new(key, self.value.clone()));
    }
}

/// One independently locked shard of the write buffer
pub(crate) struct WriteShard<T> {
    buffer: Mutex<HashMap<i64, PendingWrite<T>>>,
    pending: AtomicUsize,
}

impl<T: Value> WriteShard<T> {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Number of keys with a pending write
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Buffer one write, combining with a pending value for the same key.
    /// On a merge conflict the pending value is left untouched.
    pub fn buffer(
        &self,
        combinator: &dyn Combinator<T>,
        key: i64,
        value: Option<T>,
    ) -> Result<()> {
        let incoming = PendingWrite::new(value);
        let mut buffer = self.buffer.lock();
        match buffer.get(&key) {
            Some(pending) => {
                let merged = pending.clone().then(incoming, combinator, key)?;
                buffer.insert(key, merged);
            }
            None => {
                buffer.insert(key, incoming);
                self.pending.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Swap in an empty buffer and return the old one
    pub fn flip(&self) -> HashMap<i64, PendingWrite<T>> {
        let mut buffer = self.buffer.lock();
        self.pending.store(0, Ordering::Relaxed);
        mem::take(&mut *buffer)
    }

    /// Put back writes whose flush failed, underneath anything written since.
    /// Returns the number of keys that could not be merged back.
    pub fn restore(
        &self,
        combinator: &dyn Combinator<T>,
        older: Vec<(i64, PendingWrite<T>)>,
    ) -> usize {
        let mut buffer = self.buffer.lock();
        let mut lost = 0;
        for (key, old) in older {
            match buffer.remove(&key) {
                Some(newer) => match old.then(newer.clone(), combinator, key) {
                    Ok(merged) => {
                        buffer.insert(key, merged);
                    }
                    Err(e) => {
                        tracing::error!(key, error = %e, "Dropping unflushed write that conflicts with a newer one");
                        buffer.insert(key, newer);
                        lost += 1;
                    }
                },
                None => {
                    buffer.insert(key, old);
                }
            }
        }
        self.pending.store(buffer.len(), Ordering::Relaxed);
        lost
    }
}

/// Shard owning `key`
pub(crate) fn shard_index(key: i64, shard_count: usize) -> usize {
    key.rem_euclid(shard_count as i64) as usize
}
