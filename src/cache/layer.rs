//! Cached data interface
//!
//! Write-behind buffering plus a bounded read cache in front of another
//! data interface.
//!
//! ## Concurrency Model
//! - **Writes** go to one of N shard buffers (one mutex each) and never
//!   touch the backend
//! - **Flush** (explicit, periodic or memory reclaim) is serialized by
//!   `flush_lock`; it flips every shard and hands the old buffers to the
//!   backend in parallel
//! - **Reads** see the read cache or the backend; buffered writes become
//!   visible once a flush completes
//!
//! Any flush that reached the backend clears the whole read cache. Cache
//! fills carry the generation they started in, so a fill that raced with
//! the clear is dropped instead of resurrecting an old value.

use std::collections::BTreeSet;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::combinator::SharedCombinator;
use crate::config::CacheConfig;
use crate::error::{KeystackError, Result};
use crate::interface::{DataInterface, DataStream, KeyValue, Value};
use crate::memory::{MemoryGobbler, MemoryManager, MemoryStatus};
use crate::task::{BackgroundTask, StopSignal};

use super::read_cache::ReadCache;
use super::write_buffer::{shard_index, PendingWrite, WriteShard};

/// Memory status is re-checked every this many streamed entries
const MEMORY_CHECK_INTERVAL: usize = 256;

/// Sleep between checks while writes wait out a stuck flush
const STUCK_FLUSH_POLL: Duration = Duration::from_millis(10);

/// Rough per-entry bookkeeping cost of the maps, on top of key and value
const ENTRY_OVERHEAD_BYTES: u64 = 32;

type FlippedShard<T> = (usize, Vec<(i64, PendingWrite<T>)>);

/// State shared with the flush and warm-up tasks
struct CacheShared<T: Value> {
    name: String,
    inner: Arc<dyn DataInterface<T>>,
    combinator: SharedCombinator<T>,
    memory: Arc<dyn MemoryManager>,
    config: CacheConfig,

    shards: Box<[WriteShard<T>]>,
    read_cache: ReadCache<T>,

    /// Serializes flushes and `drop_all_data`
    flush_lock: Mutex<()>,
    /// Last time a flush went through completely
    last_flush: Mutex<Instant>,

    warm_up: Mutex<Option<BackgroundTask>>,
    closed: AtomicBool,
}

/// `DataInterface` decorator adding write buffering and a read cache
pub struct CachedDataInterface<T: Value> {
    shared: Arc<CacheShared<T>>,
    flusher: Mutex<Option<BackgroundTask>>,
}

impl<T: Value> CachedDataInterface<T> {
    /// Wrap `inner`, coalescing buffered writes with `combinator`.
    ///
    /// `combinator` must be the same one `inner` applies, otherwise buffered
    /// and direct writes would merge differently.
    pub fn new(
        inner: Arc<dyn DataInterface<T>>,
        combinator: SharedCombinator<T>,
        memory: Arc<dyn MemoryManager>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = inner.name().to_string();

        let shared = Arc::new(CacheShared {
            name,
            inner,
            combinator,
            memory: Arc::clone(&memory),
            shards: (0..config.write_shards).map(|_| WriteShard::new()).collect(),
            read_cache: ReadCache::new(config.read_cache_capacity),
            flush_lock: Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            warm_up: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        let gobbler: Arc<dyn MemoryGobbler> = shared.clone();
        memory.register_gobbler(Arc::downgrade(&gobbler));

        let flusher = match shared.config.flush_interval {
            Some(interval) => {
                let weak = Arc::downgrade(&shared);
                Some(BackgroundTask::periodic(
                    format!("cache-flush-{}", shared.name),
                    interval,
                    move || match weak.upgrade() {
                        Some(shared) => {
                            if let Err(e) = shared.flush_all() {
                                tracing::warn!(name = %shared.name, error = %e, "Periodic flush failed");
                            }
                            true
                        }
                        None => false,
                    },
                )?)
            }
            None => None,
        };

        if shared.config.warm_up && shared.config.read_cache_capacity > 0 {
            let weak = Arc::downgrade(&shared);
            let task = BackgroundTask::spawn(format!("cache-warm-up-{}", shared.name), move |stop| {
                if let Some(shared) = weak.upgrade() {
                    shared.warm_up(&stop);
                }
            })?;
            *shared.warm_up.lock() = Some(task);
        }

        Ok(Self {
            shared,
            flusher: Mutex::new(flusher),
        })
    }

    /// Keys with a buffered write not yet handed to the backend
    pub fn pending_writes(&self) -> usize {
        self.shared.pending_writes()
    }

    /// Entries held by the read cache, cached absences included
    pub fn cached_entries(&self) -> usize {
        self.shared.read_cache.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn stop_flusher(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(mut task) = flusher {
            task.stop();
        }
    }
}

impl<T: Value> CacheShared<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeystackError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn pending_writes(&self) -> usize {
        self.shards.iter().map(WriteShard::len).sum()
    }

    fn entry_bytes() -> u64 {
        (mem::size_of::<i64>() + mem::size_of::<PendingWrite<T>>()) as u64 + ENTRY_OVERHEAD_BYTES
    }

    // -------------------------------------------------------------------------
    // Write Path
    // -------------------------------------------------------------------------

    /// Gate for new writes: open, memory headroom, flushes making progress
    fn admit_writes(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.memory.wait_for_sufficient_memory(self.config.memory_wait) {
            // buffering anyway beats failing the write; the flush drains it
            tracing::debug!(name = %self.name, "Writing despite low memory");
        }
        self.wait_out_stuck_flush()
    }

    fn flush_overdue(&self, threshold: Duration) -> bool {
        self.last_flush.lock().elapsed() > threshold
    }

    /// Block while no flush has succeeded for too long
    fn wait_out_stuck_flush(&self) -> Result<()> {
        let Some(threshold) = self.config.stuck_flush_threshold() else {
            return Ok(());
        };
        if !self.flush_overdue(threshold) {
            return Ok(());
        }

        tracing::warn!(
            name = %self.name,
            pending = self.pending_writes(),
            "Flush is stuck, holding writes back"
        );
        let deadline = Instant::now() + self.config.stuck_flush_max_wait;
        loop {
            thread::sleep(STUCK_FLUSH_POLL);
            self.ensure_open()?;
            if !self.flush_overdue(threshold) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(KeystackError::BackendUnavailable(format!(
                    "{}: no successful flush within {:?}",
                    self.name,
                    threshold + self.config.stuck_flush_max_wait
                )));
            }
        }
    }

    fn buffer_write(&self, key: i64, value: Option<T>) -> Result<()> {
        let shard = &self.shards[shard_index(key, self.shards.len())];
        shard.buffer(self.combinator.as_ref(), key, value)
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    fn flush_all(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.flush_locked()
    }

    /// Caller holds `flush_lock`.
    ///
    /// 1. Flip every shard buffer
    /// 2. Hand the old buffers to the backend, one thread per shard
    /// 3. Flush the backend
    /// 4. If anything reached the backend, stop warm-up and clear the cache
    fn flush_locked(&self) -> Result<()> {
        // Step 1: Flip, keeping shard identity for restores
        let flipped: Vec<FlippedShard<T>> = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(index, shard)| {
                let buffer = shard.flip();
                if buffer.is_empty() {
                    return None;
                }
                let mut pending: Vec<_> = buffer.into_iter().collect();
                pending.sort_unstable_by_key(|(key, _)| *key);
                Some((index, pending))
            })
            .collect();
        let keys: usize = flipped.iter().map(|(_, pending)| pending.len()).sum();
        let started = Instant::now();

        // Step 2: Write shards in parallel
        let written = if flipped.is_empty() {
            Ok(())
        } else {
            self.write_shards(flipped)
        };

        // Step 3: Backend barrier, also after a merge conflict since the
        // rest of the batch was applied
        let backend_flushed = self.inner.flush();
        let progressed = written.as_ref().err().map_or(true, KeystackError::is_merge_conflict);
        if progressed && backend_flushed.is_ok() {
            *self.last_flush.lock() = Instant::now();
        }
        let result = written.and(backend_flushed);

        // Step 4: Invalidate anything cached before the flush
        if keys > 0 {
            self.stop_warm_up();
            let cleared = self.read_cache.clear();
            tracing::debug!(
                name = %self.name,
                keys,
                cleared,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Flushed write buffer"
            );
        }
        result
    }

    /// Write every flipped shard, returning the first error
    fn write_shards(&self, flipped: Vec<FlippedShard<T>>) -> Result<()> {
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = flipped
                .into_iter()
                .map(|(index, pending)| scope.spawn(move || self.write_shard(index, pending)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(KeystackError::BackendUnavailable(
                            "shard flush thread panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn write_shard(&self, index: usize, pending: Vec<(i64, PendingWrite<T>)>) -> Result<()> {
        let mut entries = Vec::with_capacity(pending.len());
        for (key, write) in &pending {
            write.push_entries(*key, &mut entries);
        }

        match self.inner.write_all(entries) {
            Ok(()) => Ok(()),
            // the rest of the batch was applied; the conflicting value is the caller's to handle
            Err(e) if e.is_merge_conflict() => Err(e),
            Err(e) => {
                let count = pending.len();
                let lost = self.shards[index].restore(self.combinator.as_ref(), pending);
                tracing::error!(
                    name = %self.name,
                    shard = index,
                    restored = count - lost,
                    error = %e,
                    "Shard flush failed, writes kept for retry"
                );
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Read Cache
    // -------------------------------------------------------------------------

    fn stop_warm_up(&self) {
        let task = self.warm_up.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// Stream the backend into the read cache until done, stopped, out of
    /// room, or memory is no longer free
    fn warm_up(&self, stop: &StopSignal) {
        let generation = self.read_cache.generation();
        let stream = match self.inner.iter() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Cache warm-up could not start");
                return;
            }
        };

        let started = Instant::now();
        let mut loaded = 0u64;
        let mut interrupted = None;
        for (seen, entry) in stream.enumerate() {
            if stop.is_stopped() || self.closed.load(Ordering::Acquire) {
                interrupted = Some("stopped");
                break;
            }
            if seen % MEMORY_CHECK_INTERVAL == 0
                && self.memory.current_memory_status() != MemoryStatus::Free
            {
                interrupted = Some("memory pressure");
                break;
            }
            if self.read_cache.is_full() {
                interrupted = Some("cache full");
                break;
            }
            if self.read_cache.generation() != generation {
                interrupted = Some("cache cleared");
                break;
            }
            match entry {
                Ok(kv) => {
                    if self.read_cache.insert_if_absent(kv.key, kv.value, generation) {
                        loaded += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "Cache warm-up read failed");
                    interrupted = Some("read error");
                    break;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match interrupted {
            Some(reason) => {
                tracing::info!(name = %self.name, loaded, reason, elapsed_ms, "Cache warm-up partial")
            }
            None => tracing::info!(name = %self.name, loaded, elapsed_ms, "Cache warm-up complete"),
        }
    }
}

impl<T: Value> MemoryGobbler for CacheShared<T> {
    fn gobbler_name(&self) -> &str {
        &self.name
    }

    fn estimated_memory_usage(&self) -> u64 {
        let entries = (self.pending_writes() + self.read_cache.len()) as u64;
        entries * Self::entry_bytes()
    }

    fn free_memory_now(&self) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        // a flush already running frees memory by itself
        let Some(_flushing) = self.flush_lock.try_lock() else {
            return 0;
        };

        let before = self.pending_writes();
        if let Err(e) = self.flush_locked() {
            tracing::warn!(name = %self.name, error = %e, "Flush for memory reclaim failed");
        }
        let drained = before.saturating_sub(self.pending_writes());
        let cleared = self.read_cache.clear();
        (drained + cleared) as u64 * Self::entry_bytes()
    }
}

/// Backend stream that fills the read cache as it goes
struct CachingStream<T: Value> {
    stream: DataStream<KeyValue<T>>,
    shared: Arc<CacheShared<T>>,
    generation: u64,
    seen: usize,
    caching: bool,
}

impl<T: Value> Iterator for CachingStream<T> {
    type Item = Result<KeyValue<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.stream.next()?;
        if let Ok(kv) = &item {
            if self.caching && self.seen > 0 && self.seen % MEMORY_CHECK_INTERVAL == 0 {
                self.caching = self.shared.memory.current_memory_status() == MemoryStatus::Free;
            }
            if self.caching {
                self.shared
                    .read_cache
                    .insert(kv.key, kv.value.clone(), self.generation);
            }
            self.seen += 1;
        }
        Some(item)
    }
}

impl<T: Value> DataInterface<T> for CachedDataInterface<T> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn read(&self, key: i64) -> Result<Option<T>> {
        let shared = &self.shared;
        shared.ensure_open()?;
        if let Some(cached) = shared.read_cache.get(key) {
            return Ok(cached);
        }

        let generation = shared.read_cache.generation();
        let value = shared.inner.read(key)?;
        shared.read_cache.insert(key, value.clone(), generation);
        Ok(value)
    }

    fn write(&self, key: i64, value: Option<T>) -> Result<()> {
        self.shared.admit_writes()?;
        self.shared.buffer_write(key, value)
    }

    fn write_all(&self, entries: Vec<KeyValue<T>>) -> Result<()> {
        let shared = &self.shared;
        let mut first_conflict = None;
        for (i, entry) in entries.into_iter().enumerate() {
            if i % shared.config.bulk_check_interval == 0 {
                shared.admit_writes()?;
            }
            match shared.buffer_write(entry.key, entry.value) {
                Ok(()) => {}
                Err(e) if e.is_merge_conflict() => {
                    first_conflict.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first_conflict.map_or(Ok(()), Err)
    }

    fn iter(&self) -> Result<DataStream<KeyValue<T>>> {
        self.shared.ensure_open()?;
        self.shared.flush_all()?;
        self.shared.inner.iter()
    }

    fn key_iter(&self) -> Result<DataStream<i64>> {
        self.shared.ensure_open()?;
        self.shared.flush_all()?;
        self.shared.inner.key_iter()
    }

    /// Cached hits come first, then backend values for the cache misses.
    /// Under memory pressure the cache is bypassed.
    fn iter_keys(&self, keys: &BTreeSet<i64>) -> Result<DataStream<KeyValue<T>>> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let status = shared.memory.current_memory_status();
        if !status.is_sufficient() {
            return shared.inner.iter_keys(keys);
        }

        let generation = shared.read_cache.generation();
        let mut hits = Vec::new();
        let mut misses = BTreeSet::new();
        for &key in keys {
            match shared.read_cache.get(key) {
                Some(Some(value)) => hits.push(Ok(KeyValue::some(key, value))),
                Some(None) => {}
                None => {
                    misses.insert(key);
                }
            }
        }

        if misses.is_empty() {
            return Ok(Box::new(hits.into_iter()));
        }
        let backend = CachingStream {
            stream: shared.inner.iter_keys(&misses)?,
            shared: Arc::clone(shared),
            generation,
            seen: 0,
            caching: status == MemoryStatus::Free,
        };
        Ok(Box::new(hits.into_iter().chain(backend)))
    }

    fn optimize_for_reading(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.flush_all()?;
        self.shared.inner.optimize_for_reading()
    }

    fn flush(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.flush_all()
    }

    fn drop_all_data(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let _flushing = shared.flush_lock.lock();
        shared.stop_warm_up();
        let discarded: usize = shared.shards.iter().map(|shard| shard.flip().len()).sum();
        let result = shared.inner.drop_all_data();
        shared.read_cache.clear();
        if result.is_ok() {
            *shared.last_flush.lock() = Instant::now();
        }
        tracing::info!(name = %shared.name, discarded, "Dropped all data");
        result
    }

    fn appr_size(&self) -> u64 {
        self.shared.inner.appr_size() + self.shared.pending_writes() as u64
    }

    fn exact_size(&self) -> Result<u64> {
        self.shared.ensure_open()?;
        self.shared.flush_all()?;
        self.shared.inner.exact_size()
    }

    /// Stop background tasks, flush, and close the backend. Teardown runs
    /// even when the flush fails; the flush error is returned afterwards.
    fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_flusher();
        shared.stop_warm_up();

        let flushed = shared.flush_all();
        if let Err(e) = &flushed {
            tracing::error!(name = %shared.name, error = %e, "Flush during close failed");
        }

        let discarded: usize = shared.shards.iter().map(|shard| shard.flip().len()).sum();
        if discarded > 0 {
            tracing::error!(name = %shared.name, discarded, "Discarding unflushed writes on close");
        }
        shared.read_cache.clear();

        let closed = shared.inner.close();
        if let Err(e) = &closed {
            tracing::error!(name = %shared.name, error = %e, "Closing backend failed");
        }
        flushed.and(closed)
    }
}

impl<T: Value> Drop for CachedDataInterface<T> {
    /// Best effort: an unclosed layer still hands its buffer to the backend,
    /// which stays open for its other owners
    fn drop(&mut self) {
        self.stop_flusher();
        self.shared.stop_warm_up();
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.shared.flush_all() {
            tracing::error!(name = %self.shared.name, error = %e, "Flush on drop failed");
        }
    }
}
