//! Bloom filter data interface
//!
//! Wraps a data interface and answers "definitely absent" reads from an
//! in-memory bloom filter.
//!
//! ## Filter Lifecycle
//! ```text
//!  Uninitialized ──load from side store──▶ Valid ◀──────────┐
//!        │                                   │              │
//!        └──nothing persisted──▶ Stale ◀─────┘ checksum     │
//!                                  │           mismatch or  │
//!                                  │           FPP too high │
//!                                  ▼                        │
//!                             Rebuilding ──scan complete────┘
//! ```
//!
//! ## Checksums
//! - `write_count` counts value writes that went through this layer
//! - a filter's checksum counts the writes whose keys it holds
//! - a filter is used only while the two are equal
//!
//! Writes insert into the live filter under `try_read` of the rebuild lock.
//! If the lock is busy the insert goes to the in-progress rebuild filter, or
//! is skipped; a skipped insert leaves the checksum behind, so the filter is
//! judged stale instead of giving a false negative.
//!
//! ## Persistence
//! The side store must never hold a filter that misses keys the backend may
//! already have made durable. A value write therefore removes the persisted
//! record before it reaches the backend, and a snapshot is only written
//! while no value write is in flight.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

use crate::config::BloomConfig;
use crate::error::{KeystackError, Result};
use crate::interface::{DataInterface, DataStream, KeyValue, Value};
use crate::task::BackgroundTask;

use super::filter::LongBloomFilter;

/// `persisted_checksum` value when the side store holds no filter of ours
const NOT_PERSISTED: i64 = -1;

/// The side store may hold a filter of ours, checksum unknown
const MAYBE_PERSISTED: i64 = -2;

/// A filter under construction plus how far the key scan has got
struct RebuildProgress {
    filter: Arc<LongBloomFilter>,
    /// Writes numbered up to this were counted before the scan started
    start_count: i64,
    /// Highest key inserted so far; the scan runs in key order
    high_water: AtomicI64,
    scanned: AtomicU64,
}

impl RebuildProgress {
    fn new(filter: LongBloomFilter) -> Self {
        Self {
            start_count: filter.checksum(),
            filter: Arc::new(filter),
            high_water: AtomicI64::new(i64::MIN),
            scanned: AtomicU64::new(0),
        }
    }

    fn record(&self, key: i64) {
        self.filter.insert(key);
        self.high_water.store(key, Ordering::Release);
        self.scanned.fetch_add(1, Ordering::Release);
    }

    /// Every key `<= high_water` that existed at scan time is in the filter
    fn covers(&self, key: i64) -> bool {
        self.scanned.load(Ordering::Acquire) > 0 && key <= self.high_water.load(Ordering::Acquire)
    }
}

/// State shared with the persistence task
struct BloomShared<T: Value> {
    name: String,
    inner: Arc<dyn DataInterface<T>>,
    side_store: Arc<dyn DataInterface<LongBloomFilter>>,
    side_key: i64,
    config: BloomConfig,

    /// Filter answering reads; swapped under `rebuild_lock`, read lock-free
    current: ArcSwapOption<LongBloomFilter>,
    /// Filter being rebuilt, visible to readers for keys already scanned
    building: ArcSwapOption<RebuildProgress>,
    /// write = replace/rebuild, read = in-place insert
    rebuild_lock: RwLock<()>,

    write_count: AtomicI64,
    persisted_checksum: AtomicI64,
    /// Value writes between persisted-record removal and `record_write`
    writes_in_flight: AtomicU64,
    /// Serializes side-store updates
    persist_lock: Mutex<()>,

    initialized: AtomicBool,
    closed: AtomicBool,
}

/// `DataInterface` decorator adding a bloom-filter existence check
pub struct BloomFilterDataInterface<T: Value> {
    shared: Arc<BloomShared<T>>,
    persister: Mutex<Option<BackgroundTask>>,
}

impl<T: Value> BloomFilterDataInterface<T> {
    /// Wrap `inner`, persisting the filter in `side_store`.
    ///
    /// The side store should overwrite on write (`OverwriteCombinator`); it
    /// may be shared between several bloom layers with distinct names.
    pub fn new(
        inner: Arc<dyn DataInterface<T>>,
        side_store: Arc<dyn DataInterface<LongBloomFilter>>,
        config: BloomConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = inner.name().to_string();
        let side_key = side_store_key(&name);

        let shared = Arc::new(BloomShared {
            name,
            inner,
            side_store,
            side_key,
            config,
            current: ArcSwapOption::empty(),
            building: ArcSwapOption::empty(),
            rebuild_lock: RwLock::new(()),
            write_count: AtomicI64::new(0),
            persisted_checksum: AtomicI64::new(NOT_PERSISTED),
            writes_in_flight: AtomicU64::new(0),
            persist_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let persister = match shared.config.persist_interval {
            Some(interval) => {
                let weak: Weak<BloomShared<T>> = Arc::downgrade(&shared);
                Some(BackgroundTask::periodic(
                    format!("bloom-persist-{}", shared.name),
                    interval,
                    move || match weak.upgrade() {
                        Some(shared) => {
                            shared.maintain();
                            true
                        }
                        None => false,
                    },
                )?)
            }
            None => None,
        };

        Ok(Self {
            shared,
            persister: Mutex::new(persister),
        })
    }

    /// `Some(false)` when the key is definitely absent, `Some(true)` when it
    /// may be present, `None` when there is no up-to-date filter.
    pub fn might_contain(&self, key: i64) -> Option<bool> {
        self.shared.ensure_initialized();
        self.shared.valid_filter().map(|f| f.might_contain(key))
    }

    /// Whether an up-to-date filter is in place
    pub fn is_filter_valid(&self) -> bool {
        self.shared.valid_filter().is_some()
    }

    /// Value writes applied through this layer since the last rebuild
    pub fn write_count(&self) -> i64 {
        self.shared.write_count.load(Ordering::Acquire)
    }

    /// Checksum of the filter last written to the side store
    pub fn persisted_checksum(&self) -> Option<i64> {
        match self.shared.persisted_checksum.load(Ordering::Acquire) {
            checksum if checksum < 0 => None,
            checksum => Some(checksum),
        }
    }

    /// Estimated false-positive rate of the live filter
    pub fn estimated_fpp(&self) -> Option<f64> {
        self.shared.current.load_full().map(|f| f.estimated_fpp())
    }

    /// Make sure a valid filter exists, rebuilding synchronously if needed
    pub fn rebuild_if_stale(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.ensure_initialized();
        self.shared.rebuild_blocking()?;
        self.shared.sync_side_store();
        Ok(())
    }
}

impl<T: Value> BloomShared<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeystackError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Load the persisted filter on first use
    fn ensure_initialized(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.rebuild_lock.write();
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        match self.side_store.read(self.side_key) {
            Ok(Some(filter)) => {
                let checksum = filter.checksum();
                tracing::info!(
                    name = %self.name,
                    checksum,
                    bits = filter.bit_count(),
                    "Loaded persisted bloom filter"
                );
                self.write_count.store(checksum, Ordering::Release);
                self.persisted_checksum.store(checksum, Ordering::Release);
                self.current.store(Some(Arc::new(filter)));
            }
            Ok(None) => {
                tracing::debug!(name = %self.name, "No persisted bloom filter, will rebuild on first read");
            }
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Failed to load persisted bloom filter");
            }
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// The live filter, if its checksum matches the write count
    fn valid_filter(&self) -> Option<Arc<LongBloomFilter>> {
        self.current
            .load_full()
            .filter(|f| f.checksum() == self.write_count.load(Ordering::Acquire))
    }

    /// Whether `key` may be present. Rebuilds a stale filter when this
    /// thread wins the rebuild lock, otherwise degrades to "maybe".
    fn might_contain(&self, key: i64) -> Result<bool> {
        if let Some(filter) = self.valid_filter() {
            return Ok(filter.might_contain(key));
        }

        if let Some(progress) = self.building.load_full() {
            return Ok(!progress.covers(key) || progress.filter.might_contain(key));
        }

        let rebuilt = match self.rebuild_lock.try_write() {
            Some(_guard) => {
                if let Some(filter) = self.valid_filter() {
                    // someone else finished a rebuild before we got the lock
                    return Ok(filter.might_contain(key));
                }
                self.rebuild_locked()?
            }
            None => return Ok(true),
        };
        self.sync_side_store();
        Ok(rebuilt.might_contain(key))
    }

    /// Rebuild unless the filter is already valid, waiting for the lock
    fn rebuild_blocking(&self) -> Result<()> {
        let _guard = self.rebuild_lock.write();
        if self.valid_filter().is_none() {
            self.rebuild_locked()?;
        }
        Ok(())
    }

    /// Full key scan into a fresh filter. Caller holds `rebuild_lock` for write.
    fn rebuild_locked(&self) -> Result<Arc<LongBloomFilter>> {
        let appr_size = self.inner.appr_size();
        let expected = ((appr_size as f64 * self.config.growth_factor).ceil() as u64)
            .max(self.config.min_expected_keys);
        let limit = expected
            .saturating_mul(self.config.size_violation_factor)
            .max(self.config.size_violation_floor);

        let progress = self.start_rebuild(expected);
        tracing::info!(
            name = %self.name,
            expected,
            checksum = progress.start_count,
            "Rebuilding bloom filter"
        );
        let started = std::time::Instant::now();

        let scanned = self.scan_keys(&progress, expected, limit);

        match scanned {
            Ok(count) => {
                self.current.store(Some(Arc::clone(&progress.filter)));
                self.building.store(None);
                tracing::info!(
                    name = %self.name,
                    keys = count,
                    bits = progress.filter.bit_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Bloom filter rebuilt"
                );
                Ok(Arc::clone(&progress.filter))
            }
            Err(e) => {
                self.building.store(None);
                tracing::error!(name = %self.name, error = %e, "Bloom filter rebuild aborted");
                Err(e)
            }
        }
    }

    /// Publish an empty filter tagged with the current write count
    fn start_rebuild(&self, expected: u64) -> Arc<RebuildProgress> {
        let checksum = self.write_count.load(Ordering::Acquire);
        let progress = Arc::new(RebuildProgress::new(LongBloomFilter::with_capacity(
            expected,
            self.config.target_fpp,
            checksum,
        )));
        self.building.store(Some(Arc::clone(&progress)));
        progress
    }

    fn scan_keys(&self, progress: &RebuildProgress, expected: u64, limit: u64) -> Result<u64> {
        let mut count = 0u64;
        for key in self.inner.key_iter()? {
            progress.record(key?);
            count += 1;
            if count > limit {
                return Err(KeystackError::SizeEstimateViolation {
                    name: self.name.clone(),
                    observed: count,
                    expected,
                });
            }
        }
        Ok(count)
    }

    /// Count a value write and insert its key where possible
    fn record_write(&self, key: i64) {
        let count = self.count_write();
        self.insert_counted(key, count);
    }

    /// Returns the number this write was counted as
    fn count_write(&self) -> i64 {
        self.write_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn insert_counted(&self, key: i64, count: i64) {
        if let Some(_guard) = self.rebuild_lock.try_read() {
            if let Some(filter) = self.current.load_full() {
                filter.insert(key);
                filter.bump_checksum();
            }
        } else if let Some(progress) = self.building.load_full() {
            progress.filter.insert(key);
            // counted before the scan started: already in its checksum
            if count > progress.start_count {
                progress.filter.bump_checksum();
            }
        }
    }

    /// Announce a value write and make sure no persisted filter predates it.
    /// The returned guard must live until the write has been recorded.
    fn begin_value_write(&self) -> Result<InFlightWrite<'_>> {
        self.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightWrite(&self.writes_in_flight);
        if self.persisted_checksum.load(Ordering::SeqCst) != NOT_PERSISTED {
            self.remove_persisted()?;
        }
        Ok(guard)
    }

    /// Delete our side-store record ahead of a backend write
    fn remove_persisted(&self) -> Result<()> {
        let _persist = self.persist_lock.lock();
        if self.persisted_checksum.load(Ordering::SeqCst) == NOT_PERSISTED {
            return Ok(());
        }
        self.write_side_store(None).map_err(|e| {
            tracing::warn!(name = %self.name, error = %e, "Failed to remove persisted bloom filter");
            e
        })?;
        self.persisted_checksum.store(NOT_PERSISTED, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the live filter once it is too full to be useful
    fn invalidate_if_saturated(&self) {
        let Some(filter) = self.current.load_full() else {
            return;
        };
        let fpp = filter.estimated_fpp();
        if fpp <= self.config.max_fpp() {
            return;
        }

        let _guard = self.rebuild_lock.write();
        let still_current = self
            .current
            .load_full()
            .map_or(false, |live| Arc::ptr_eq(&live, &filter));
        if still_current {
            tracing::warn!(
                name = %self.name,
                estimated_fpp = fpp,
                max_fpp = self.config.max_fpp(),
                "Bloom filter saturated, discarding"
            );
            self.current.store(None);
        }
    }

    /// A copy of the live filter that holds every counted write, if any
    fn persistable_snapshot(&self) -> Option<LongBloomFilter> {
        let filter = self.valid_filter()?;
        let snapshot = (*filter).clone();
        // equal only if no write was counted but not yet inserted
        (snapshot.checksum() == self.write_count.load(Ordering::Acquire)).then_some(snapshot)
    }

    /// Bring the side store in line with the live filter. Failures are
    /// logged; the filter is only an optimization.
    fn sync_side_store(&self) {
        let _persist = self.persist_lock.lock();
        let persisted = self.persisted_checksum.load(Ordering::Acquire);

        match self.persistable_snapshot() {
            Some(snapshot) => {
                let checksum = snapshot.checksum();
                if checksum == persisted {
                    return;
                }
                // pairs with begin_value_write: either the writer sees this
                // store and removes the record, or we see the writer and back off
                self.persisted_checksum.store(MAYBE_PERSISTED, Ordering::SeqCst);
                if self.writes_in_flight.load(Ordering::SeqCst) > 0 {
                    self.persisted_checksum.store(persisted, Ordering::SeqCst);
                    return;
                }
                match self.write_side_store(Some(snapshot)) {
                    Ok(()) => {
                        self.persisted_checksum.store(checksum, Ordering::SeqCst);
                        tracing::debug!(name = %self.name, checksum, "Persisted bloom filter");
                    }
                    Err(e) => {
                        tracing::warn!(name = %self.name, error = %e, "Failed to persist bloom filter");
                    }
                }
            }
            None if persisted != NOT_PERSISTED => {
                // the persisted copy is older than the data: it must not be
                // reloaded as valid
                match self.write_side_store(None) {
                    Ok(()) => {
                        self.persisted_checksum.store(NOT_PERSISTED, Ordering::SeqCst);
                        tracing::debug!(name = %self.name, "Removed outdated persisted bloom filter");
                    }
                    Err(e) => {
                        tracing::warn!(name = %self.name, error = %e, "Failed to remove outdated bloom filter");
                    }
                }
            }
            None => {}
        }
    }

    fn write_side_store(&self, filter: Option<LongBloomFilter>) -> Result<()> {
        self.side_store.write(self.side_key, filter)?;
        self.side_store.flush()
    }

    /// Periodic work: discard a saturated filter, persist a changed one
    fn maintain(&self) {
        if self.closed.load(Ordering::Acquire) || !self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.invalidate_if_saturated();
        self.sync_side_store();
    }
}

/// Keeps a value write counted as in flight until dropped
struct InFlightWrite<'a>(&'a AtomicU64);

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Side-store key derived from the data interface name
fn side_store_key(name: &str) -> i64 {
    crc32fast::hash(name.as_bytes()) as i64
}

impl<T: Value> DataInterface<T> for BloomFilterDataInterface<T> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn read(&self, key: i64) -> Result<Option<T>> {
        let shared = &self.shared;
        shared.ensure_open()?;
        shared.ensure_initialized();
        if !shared.might_contain(key)? {
            return Ok(None);
        }
        shared.inner.read(key)
    }

    fn write(&self, key: i64, value: Option<T>) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;
        shared.ensure_initialized();
        // deletions never make a filter answer wrongly, so they are not counted
        if value.is_none() {
            return shared.inner.write(key, value);
        }
        let _in_flight = shared.begin_value_write()?;
        shared.inner.write(key, value)?;
        shared.record_write(key);
        Ok(())
    }

    fn write_all(&self, entries: Vec<KeyValue<T>>) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;
        shared.ensure_initialized();
        let keys: Vec<i64> = entries
            .iter()
            .filter(|e| e.value.is_some())
            .map(|e| e.key)
            .collect();
        let _in_flight = if keys.is_empty() {
            None
        } else {
            Some(shared.begin_value_write()?)
        };
        let result = shared.inner.write_all(entries);
        // a failed batch may still have applied part of its entries
        for key in keys {
            shared.record_write(key);
        }
        result
    }

    fn iter(&self) -> Result<DataStream<KeyValue<T>>> {
        self.shared.ensure_open()?;
        self.shared.inner.iter()
    }

    fn key_iter(&self) -> Result<DataStream<i64>> {
        self.shared.ensure_open()?;
        self.shared.inner.key_iter()
    }

    fn iter_keys(&self, keys: &BTreeSet<i64>) -> Result<DataStream<KeyValue<T>>> {
        let shared = &self.shared;
        shared.ensure_open()?;
        shared.ensure_initialized();
        match shared.valid_filter() {
            Some(filter) => {
                let candidates: BTreeSet<i64> = keys
                    .iter()
                    .copied()
                    .filter(|&key| filter.might_contain(key))
                    .collect();
                shared.inner.iter_keys(&candidates)
            }
            None => shared.inner.iter_keys(keys),
        }
    }

    fn optimize_for_reading(&self) -> Result<()> {
        self.rebuild_if_stale()?;
        self.shared.inner.optimize_for_reading()
    }

    fn flush(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.inner.flush()?;
        self.shared.maintain();
        Ok(())
    }

    fn drop_all_data(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;
        shared.ensure_initialized();
        {
            let _guard = shared.rebuild_lock.write();
            shared.inner.drop_all_data()?;
            shared.write_count.store(0, Ordering::Release);
            shared.current.store(None);
            shared.rebuild_locked()?;
        }
        shared.sync_side_store();
        Ok(())
    }

    fn appr_size(&self) -> u64 {
        self.shared.inner.appr_size()
    }

    fn exact_size(&self) -> Result<u64> {
        self.shared.ensure_open()?;
        self.shared.inner.exact_size()
    }

    fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let persister = self.persister.lock().take();
        if let Some(mut task) = persister {
            task.stop();
        }
        if shared.initialized.load(Ordering::Acquire) {
            shared.sync_side_store();
        }
        shared.inner.close()
    }
}
