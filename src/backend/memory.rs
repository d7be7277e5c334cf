//! In-memory backend
//!
//! Ordered map with merge-on-write. Nothing survives the process.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::combinator::SharedCombinator;
use crate::error::{KeystackError, Result};
use crate::interface::{DataInterface, DataStream, KeyValue, Value};

use super::store::OrderedStore;

/// `DataInterface` over an in-memory ordered map
pub struct MemoryDataInterface<T> {
    name: String,
    combinator: SharedCombinator<T>,
    store: OrderedStore<T>,
    closed: AtomicBool,
}

impl<T: Value> MemoryDataInterface<T> {
    pub fn new(name: impl Into<String>, combinator: SharedCombinator<T>) -> Self {
        Self {
            name: name.into(),
            combinator,
            store: OrderedStore::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_store(
        name: impl Into<String>,
        combinator: SharedCombinator<T>,
        store: OrderedStore<T>,
    ) -> Self {
        Self {
            name: name.into(),
            combinator,
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn store(&self) -> &OrderedStore<T> {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KeystackError::Closed(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl<T: Value> DataInterface<T> for MemoryDataInterface<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, key: i64) -> Result<Option<T>> {
        self.ensure_open()?;
        Ok(self.store.get(key))
    }

    fn write(&self, key: i64, value: Option<T>) -> Result<()> {
        self.ensure_open()?;
        self.store.apply(self.combinator.as_ref(), key, value)
    }

    fn write_all(&self, entries: Vec<KeyValue<T>>) -> Result<()> {
        self.ensure_open()?;
        self.store.apply_all(self.combinator.as_ref(), entries)
    }

    fn iter(&self) -> Result<DataStream<KeyValue<T>>> {
        self.ensure_open()?;
        Ok(self.store.stream())
    }

    fn key_iter(&self) -> Result<DataStream<i64>> {
        self.ensure_open()?;
        Ok(self.store.key_stream())
    }

    fn iter_keys(&self, keys: &BTreeSet<i64>) -> Result<DataStream<KeyValue<T>>> {
        self.ensure_open()?;
        Ok(self.store.keys_stream(keys))
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    fn drop_all_data(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.clear();
        Ok(())
    }

    fn appr_size(&self) -> u64 {
        self.store.len() as u64
    }

    fn exact_size(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.store.len() as u64)
    }

    fn close(&self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }
}
