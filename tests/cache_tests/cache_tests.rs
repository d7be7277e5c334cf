//! Cached Layer Tests
//!
//! Tests verify:
//! - Buffered writes coalesce exactly like direct writes
//! - Flush makes writes visible and invalidates the read cache
//! - Merge conflicts, both while buffering and at flush time
//! - Failed flushes keep their writes for the next attempt
//! - Writers are held back, then failed, while flushes keep failing
//! - Background flush and warm-up
//! - Close: idempotent, flushes, tears down even when the flush fails

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use keystack::combinator::{SumCombinator, UniqueCombinator};
use keystack::{
    BudgetMemoryManager, CacheConfig, CachedDataInterface, DataInterface, DataStream, KeyValue,
    KeystackError, MemoryDataInterface, Result,
};

fn manual_config() -> CacheConfig {
    CacheConfig::builder()
        .flush_interval(None)
        .warm_up(false)
        .build()
}

fn cache_over(
    inner: Arc<dyn DataInterface<i64>>,
    config: CacheConfig,
) -> CachedDataInterface<i64> {
    CachedDataInterface::new(
        inner,
        Arc::new(SumCombinator),
        Arc::new(BudgetMemoryManager::unbounded()),
        config,
    )
    .unwrap()
}

fn sum_memory() -> Arc<MemoryDataInterface<i64>> {
    Arc::new(MemoryDataInterface::new("counts", Arc::new(SumCombinator)))
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn collect_all(interface: &dyn DataInterface<i64>) -> Vec<KeyValue<i64>> {
    interface.iter().unwrap().map(|kv| kv.unwrap()).collect()
}

/// Memory backend whose writes and flushes fail on demand
struct FlakyBackend {
    memory: MemoryDataInterface<i64>,
    failing: AtomicBool,
}

impl FlakyBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            memory: MemoryDataInterface::new("flaky", Arc::new(SumCombinator)),
            failing: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KeystackError::BackendUnavailable("disk on fire".to_string()));
        }
        Ok(())
    }
}

impl DataInterface<i64> for FlakyBackend {
    fn name(&self) -> &str {
        self.memory.name()
    }
    fn read(&self, key: i64) -> Result<Option<i64>> {
        self.memory.read(key)
    }
    fn write(&self, key: i64, value: Option<i64>) -> Result<()> {
        self.check()?;
        self.memory.write(key, value)
    }
    fn write_all(&self, entries: Vec<KeyValue<i64>>) -> Result<()> {
        self.check()?;
        self.memory.write_all(entries)
    }
    fn iter(&self) -> Result<DataStream<KeyValue<i64>>> {
        self.memory.iter()
    }
    fn key_iter(&self) -> Result<DataStream<i64>> {
        self.memory.key_iter()
    }
    fn flush(&self) -> Result<()> {
        self.check()?;
        self.memory.flush()
    }
    fn drop_all_data(&self) -> Result<()> {
        self.memory.drop_all_data()
    }
    fn appr_size(&self) -> u64 {
        self.memory.appr_size()
    }
    fn exact_size(&self) -> Result<u64> {
        self.memory.exact_size()
    }
    fn close(&self) -> Result<()> {
        self.memory.close()
    }
}

// =============================================================================
// Buffered Writes
// =============================================================================

#[test]
fn test_sum_scenario() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());

    cache.write(42, Some(3)).unwrap();
    cache.write(42, Some(4)).unwrap();
    assert_eq!(cache.pending_writes(), 1);
    cache.flush().unwrap();
    assert_eq!(cache.read(42).unwrap(), Some(7));
    assert_eq!(memory.read(42).unwrap(), Some(7));

    cache.write(42, None).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.read(42).unwrap(), None);
}

#[test]
fn test_writes_are_invisible_until_flush() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());

    cache.write(1, Some(1)).unwrap();
    assert_eq!(memory.read(1).unwrap(), None);
    assert_eq!(cache.appr_size(), 1);

    cache.flush().unwrap();
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(memory.read(1).unwrap(), Some(1));
}

#[test]
fn test_buffered_coalescing_matches_direct_writes() {
    let writes: Vec<(i64, Option<i64>)> = vec![
        (1, Some(5)),
        (2, Some(1)),
        (1, Some(2)),
        (3, Some(9)),
        (2, None),
        (1, None),
        (1, Some(4)),
        (2, Some(6)),
        (3, Some(-9)),
        (4, None),
    ];

    let direct = sum_memory();
    direct.write(1, Some(100)).unwrap();
    direct.write(2, Some(200)).unwrap();
    for &(key, value) in &writes {
        direct.write(key, value).unwrap();
    }

    let buffered_backend = sum_memory();
    buffered_backend.write(1, Some(100)).unwrap();
    buffered_backend.write(2, Some(200)).unwrap();
    let cache = cache_over(buffered_backend.clone(), manual_config());
    for &(key, value) in &writes {
        cache.write(key, value).unwrap();
    }
    cache.flush().unwrap();

    assert_eq!(collect_all(buffered_backend.as_ref()), collect_all(direct.as_ref()));
}

#[test]
fn test_value_after_deletion_is_not_combined_with_old_value() {
    let memory = sum_memory();
    memory.write(7, Some(10)).unwrap();
    let cache = cache_over(memory.clone(), manual_config());

    cache.write(7, None).unwrap();
    cache.write(7, Some(5)).unwrap();
    cache.flush().unwrap();
    assert_eq!(memory.read(7).unwrap(), Some(5));
}

#[test]
fn test_write_all_buffers_every_entry() {
    let memory = sum_memory();
    let config = CacheConfig::builder()
        .flush_interval(None)
        .warm_up(false)
        .bulk_check_interval(7)
        .build();
    let cache = cache_over(memory.clone(), config);

    cache
        .write_all((0..1_000).map(|i| KeyValue::some(i % 100, 1)).collect())
        .unwrap();
    assert_eq!(cache.pending_writes(), 100);
    cache.flush().unwrap();
    assert_eq!(memory.read(0).unwrap(), Some(10));
    assert_eq!(memory.exact_size().unwrap(), 100);
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    let memory = sum_memory();
    let cache = Arc::new(cache_over(memory.clone(), manual_config()));

    let writers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for key in 0..500 {
                    cache.write(key, Some(1)).unwrap();
                }
            })
        })
        .collect();
    let flusher = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for _ in 0..20 {
                cache.flush().unwrap();
            }
        })
    };
    for writer in writers {
        writer.join().unwrap();
    }
    flusher.join().unwrap();
    cache.flush().unwrap();

    for key in 0..500 {
        assert_eq!(memory.read(key).unwrap(), Some(8));
    }
}

// =============================================================================
// Read Cache
// =============================================================================

#[test]
fn test_flush_invalidates_stale_cache_entries() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());

    cache.write(5, Some(1)).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.read(5).unwrap(), Some(1));
    assert_eq!(cache.read(6).unwrap(), None);
    assert_eq!(cache.cached_entries(), 2);

    cache.write(5, Some(2)).unwrap();
    cache.write(6, Some(9)).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.read(5).unwrap(), Some(3));
    assert_eq!(cache.read(6).unwrap(), Some(9));
}

#[test]
fn test_read_serves_cached_absence() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());

    assert_eq!(cache.read(3).unwrap(), None);
    // written behind the cache's back: the cached absence still answers
    memory.write(3, Some(3)).unwrap();
    assert_eq!(cache.read(3).unwrap(), None);
}

#[test]
fn test_iter_keys_returns_cached_hits_first() {
    let memory = sum_memory();
    for key in 1..=5 {
        memory.write(key, Some(key * 10)).unwrap();
    }
    let cache = cache_over(memory.clone(), manual_config());
    assert_eq!(cache.read(4).unwrap(), Some(40));
    assert_eq!(cache.read(9).unwrap(), None);

    let wanted: BTreeSet<i64> = [1, 2, 3, 4, 5, 9].into_iter().collect();
    let keys: Vec<i64> = cache
        .iter_keys(&wanted)
        .unwrap()
        .map(|kv| kv.unwrap().key)
        .collect();
    assert_eq!(keys, vec![4, 1, 2, 3, 5]);
    // streamed values were cached on the way
    assert_eq!(cache.cached_entries(), 6);
}

#[test]
fn test_iteration_flushes_first() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());
    cache.write(2, Some(2)).unwrap();
    cache.write(1, Some(1)).unwrap();

    let keys: Vec<i64> = cache.key_iter().unwrap().map(|k| k.unwrap()).collect();
    assert_eq!(keys, vec![1, 2]);
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(cache.iter().unwrap().count(), 2);
}

#[test]
fn test_exact_size_includes_pending_writes() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), manual_config());
    cache.write(1, Some(1)).unwrap();
    cache.write(2, Some(1)).unwrap();
    assert_eq!(cache.exact_size().unwrap(), 2);
}

#[test]
fn test_warm_up_fills_read_cache() {
    let memory = sum_memory();
    memory
        .write_all((0..100).map(|i| KeyValue::some(i, i)).collect())
        .unwrap();
    let config = CacheConfig::builder().flush_interval(None).build();
    let cache = cache_over(memory.clone(), config);

    assert!(wait_until(Duration::from_secs(5), || cache.cached_entries() == 100));
    assert_eq!(cache.read(50).unwrap(), Some(50));
}

#[test]
fn test_warm_up_respects_capacity() {
    let memory = sum_memory();
    memory
        .write_all((0..10_000).map(|i| KeyValue::some(i, i)).collect())
        .unwrap();
    let config = CacheConfig::builder()
        .flush_interval(None)
        .read_cache_capacity(320)
        .build();
    let cache = cache_over(memory.clone(), config);

    thread::sleep(Duration::from_millis(200));
    assert!(cache.cached_entries() <= 320);
}

// =============================================================================
// Merge Conflicts
// =============================================================================

#[test]
fn test_conflicting_buffered_write_is_refused() {
    let memory: Arc<MemoryDataInterface<i64>> =
        Arc::new(MemoryDataInterface::new("ids", Arc::new(UniqueCombinator)));
    let cache = CachedDataInterface::new(
        memory.clone(),
        Arc::new(UniqueCombinator),
        Arc::new(BudgetMemoryManager::unbounded()),
        manual_config(),
    )
    .unwrap();

    cache.write(1, Some(100)).unwrap();
    cache.write(1, Some(100)).unwrap();
    let err = cache.write(1, Some(200)).unwrap_err();
    assert!(err.is_merge_conflict());

    cache.flush().unwrap();
    assert_eq!(memory.read(1).unwrap(), Some(100));
}

#[test]
fn test_conflict_at_flush_time_is_reported() {
    let memory: Arc<MemoryDataInterface<i64>> =
        Arc::new(MemoryDataInterface::new("ids", Arc::new(UniqueCombinator)));
    memory.write(1, Some(100)).unwrap();
    let cache = CachedDataInterface::new(
        memory.clone(),
        Arc::new(UniqueCombinator),
        Arc::new(BudgetMemoryManager::unbounded()),
        CacheConfig::builder()
            .flush_interval(None)
            .warm_up(false)
            .write_shards(1)
            .build(),
    )
    .unwrap();

    cache.write(1, Some(200)).unwrap();
    cache.write(2, Some(2)).unwrap();
    let err = cache.flush().unwrap_err();
    match err {
        KeystackError::MergeConflict { key, .. } => assert_eq!(key, 1),
        other => panic!("unexpected error: {other:?}"),
    }

    // not retried, other keys applied
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(memory.read(1).unwrap(), Some(100));
    assert_eq!(memory.read(2).unwrap(), Some(2));
}

// =============================================================================
// Flush Failures and Backpressure
// =============================================================================

#[test]
fn test_failed_flush_keeps_writes() {
    let backend = FlakyBackend::new();
    let cache = cache_over(backend.clone(), manual_config());

    cache.write(1, Some(1)).unwrap();
    backend.set_failing(true);
    assert!(matches!(cache.flush(), Err(KeystackError::BackendUnavailable(_))));
    assert_eq!(cache.pending_writes(), 1);

    cache.write(1, Some(2)).unwrap();
    backend.set_failing(false);
    cache.flush().unwrap();
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(backend.read(1).unwrap(), Some(3));
}

#[test]
fn test_stuck_flush_fails_writes() {
    let backend = FlakyBackend::new();
    let config = CacheConfig::builder()
        .flush_interval(Some(Duration::from_millis(10)))
        .stuck_flush_factor(2)
        .stuck_flush_max_wait(Duration::from_millis(50))
        .warm_up(false)
        .build();
    let cache = cache_over(backend.clone(), config);

    backend.set_failing(true);
    cache.write(1, Some(1)).unwrap();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let err = cache.write(2, Some(1)).unwrap_err();
    assert!(matches!(err, KeystackError::BackendUnavailable(_)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    backend.set_failing(false);
    assert!(wait_until(Duration::from_secs(5), || cache.write(2, Some(1)).is_ok()));
    cache.flush().unwrap();
    assert_eq!(backend.read(1).unwrap(), Some(1));
}

#[test]
fn test_periodic_flush_drains_buffer() {
    let memory = sum_memory();
    let config = CacheConfig::builder()
        .flush_interval(Some(Duration::from_millis(20)))
        .warm_up(false)
        .build();
    let cache = cache_over(memory.clone(), config);

    cache.write(1, Some(1)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        memory.read(1).unwrap() == Some(1)
    }));
    assert_eq!(cache.pending_writes(), 0);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_drop_all_data_discards_pending_writes() {
    let memory = sum_memory();
    memory.write(1, Some(1)).unwrap();
    let cache = cache_over(memory.clone(), manual_config());
    assert_eq!(cache.read(1).unwrap(), Some(1));
    cache.write(2, Some(2)).unwrap();

    cache.drop_all_data().unwrap();
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(cache.cached_entries(), 0);
    assert_eq!(cache.read(1).unwrap(), None);
    cache.flush().unwrap();
    assert_eq!(cache.exact_size().unwrap(), 0);
}

#[test]
fn test_close_flushes_and_closes_backend() {
    let memory = sum_memory();
    let cache = cache_over(memory.clone(), CacheConfig::default());
    cache.write(1, Some(1)).unwrap();

    cache.close().unwrap();
    cache.close().unwrap();
    assert!(cache.is_closed());
    assert!(memory.is_closed());
    assert!(matches!(cache.read(1), Err(KeystackError::Closed(_))));
    assert!(matches!(cache.write(1, Some(1)), Err(KeystackError::Closed(_))));
    assert!(matches!(cache.flush(), Err(KeystackError::Closed(_))));
}

#[test]
fn test_close_tears_down_when_flush_fails() {
    let backend = FlakyBackend::new();
    let cache = cache_over(backend.clone(), manual_config());
    cache.write(1, Some(1)).unwrap();
    assert_eq!(cache.read(5).unwrap(), None);

    backend.set_failing(true);
    let err = cache.close().unwrap_err();
    assert!(matches!(err, KeystackError::BackendUnavailable(_)));

    assert!(cache.is_closed());
    assert_eq!(cache.pending_writes(), 0);
    assert_eq!(cache.cached_entries(), 0);
    assert!(matches!(backend.read(1), Err(KeystackError::Closed(_))));
    cache.close().unwrap();
}

#[test]
fn test_drop_flushes_without_closing_backend() {
    let memory = sum_memory();
    {
        let cache = cache_over(memory.clone(), CacheConfig::default());
        cache.write(1, Some(1)).unwrap();
    }
    assert!(!memory.is_closed());
    assert_eq!(memory.read(1).unwrap(), Some(1));
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = CachedDataInterface::new(
        sum_memory(),
        Arc::new(SumCombinator),
        Arc::new(BudgetMemoryManager::unbounded()),
        CacheConfig::builder().write_shards(0).build(),
    );
    assert!(matches!(result, Err(KeystackError::Config(_))));
}
