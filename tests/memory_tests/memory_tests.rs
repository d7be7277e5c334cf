//! Memory Manager Tests
//!
//! Tests verify:
//! - Status thresholds of the budget manager
//! - Gobbler registration is weak
//! - Waiting reclaims from the largest gobblers first
//! - The cached layer drains its buffer under pressure
//! - Warm-up backs off when memory is not free

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use keystack::combinator::SumCombinator;
use keystack::{
    BudgetMemoryManager, CacheConfig, CachedDataInterface, DataInterface, KeyValue,
    MemoryDataInterface, MemoryGobbler, MemoryManager, MemoryStatus,
};

/// Gobbler holding a fixed amount until asked to free it
struct FixedGobbler {
    name: String,
    usage: AtomicU64,
    freed_calls: AtomicU64,
}

impl FixedGobbler {
    fn new(name: &str, usage: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            usage: AtomicU64::new(usage),
            freed_calls: AtomicU64::new(0),
        })
    }
}

impl MemoryGobbler for FixedGobbler {
    fn gobbler_name(&self) -> &str {
        &self.name
    }

    fn estimated_memory_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn free_memory_now(&self) -> u64 {
        self.freed_calls.fetch_add(1, Ordering::SeqCst);
        self.usage.swap(0, Ordering::SeqCst)
    }
}

fn register(manager: &BudgetMemoryManager, gobbler: &Arc<FixedGobbler>) {
    let gobbler: Arc<dyn MemoryGobbler> = gobbler.clone();
    let weak: Weak<dyn MemoryGobbler> = Arc::downgrade(&gobbler);
    manager.register_gobbler(weak);
}

// =============================================================================
// Budget Manager
// =============================================================================

#[test]
fn test_status_thresholds() {
    let manager = BudgetMemoryManager::new(1_000);
    let cases = [
        (0, MemoryStatus::Free),
        (499, MemoryStatus::Free),
        (500, MemoryStatus::SomewhatLow),
        (749, MemoryStatus::SomewhatLow),
        (750, MemoryStatus::Low),
        (899, MemoryStatus::Low),
        (900, MemoryStatus::Critical),
        (5_000, MemoryStatus::Critical),
    ];
    for (usage, expected) in cases {
        manager.set_external_usage(usage);
        assert_eq!(manager.current_memory_status(), expected, "usage {usage}");
    }
}

#[test]
fn test_sufficient_means_below_low() {
    assert!(MemoryStatus::Free.is_sufficient());
    assert!(MemoryStatus::SomewhatLow.is_sufficient());
    assert!(!MemoryStatus::Low.is_sufficient());
    assert!(!MemoryStatus::Critical.is_sufficient());
}

#[test]
fn test_unbounded_is_always_free() {
    let manager = BudgetMemoryManager::unbounded();
    manager.set_external_usage(u64::MAX);
    assert_eq!(manager.current_memory_status(), MemoryStatus::Free);
    assert!(manager.wait_for_sufficient_memory(Duration::ZERO));
}

#[test]
fn test_dropped_gobblers_are_unregistered() {
    let manager = BudgetMemoryManager::new(1_000);
    let gobbler = FixedGobbler::new("temp", 800);
    register(&manager, &gobbler);
    assert_eq!(manager.gobbler_count(), 1);
    assert_eq!(manager.current_memory_status(), MemoryStatus::Low);

    drop(gobbler);
    assert_eq!(manager.gobbler_count(), 0);
    assert_eq!(manager.current_memory_status(), MemoryStatus::Free);
}

#[test]
fn test_wait_reclaims_largest_first() {
    let manager = BudgetMemoryManager::new(1_000);
    let big = FixedGobbler::new("big", 600);
    let small = FixedGobbler::new("small", 300);
    register(&manager, &small);
    register(&manager, &big);
    assert_eq!(manager.current_memory_status(), MemoryStatus::Critical);

    assert!(manager.wait_for_sufficient_memory(Duration::from_secs(1)));
    assert_eq!(big.freed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(small.freed_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.total_usage(), 300);
}

#[test]
fn test_wait_gives_up_after_timeout() {
    let manager = BudgetMemoryManager::new(1_000).with_poll_interval(Duration::from_millis(5));
    manager.set_external_usage(950);

    let started = Instant::now();
    assert!(!manager.wait_for_sufficient_memory(Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_wait_returns_once_usage_drops() {
    let manager = Arc::new(BudgetMemoryManager::new(1_000));
    manager.set_external_usage(950);

    let releaser = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            manager.set_external_usage(100);
        })
    };
    assert!(manager.wait_for_sufficient_memory(Duration::from_secs(5)));
    releaser.join().unwrap();
}

// =============================================================================
// Cached Layer Integration
// =============================================================================

#[test]
fn test_cache_drains_under_memory_pressure() {
    // room for roughly a hundred buffered entries
    let manager = Arc::new(BudgetMemoryManager::new(6_400));
    let memory = Arc::new(MemoryDataInterface::new("counts", Arc::new(SumCombinator)));
    let cache = CachedDataInterface::new(
        memory.clone(),
        Arc::new(SumCombinator),
        manager.clone(),
        CacheConfig::builder()
            .flush_interval(None)
            .warm_up(false)
            .build(),
    )
    .unwrap();
    assert_eq!(manager.gobbler_count(), 1);

    for key in 0..1_000 {
        cache.write(key, Some(1)).unwrap();
    }
    assert!(cache.pending_writes() < 100, "pending {}", cache.pending_writes());
    assert!(memory.exact_size().unwrap() >= 900);

    cache.flush().unwrap();
    assert_eq!(memory.exact_size().unwrap(), 1_000);

    drop(cache);
    assert_eq!(manager.gobbler_count(), 0);
}

#[test]
fn test_warm_up_backs_off_when_memory_is_not_free() {
    let manager = Arc::new(BudgetMemoryManager::new(1_000));
    manager.set_external_usage(600);

    let memory = Arc::new(MemoryDataInterface::new("counts", Arc::new(SumCombinator)));
    memory
        .write_all((0..1_000).map(|i| KeyValue::some(i, i)).collect())
        .unwrap();

    let cache = CachedDataInterface::new(
        memory.clone(),
        Arc::new(SumCombinator),
        manager,
        CacheConfig::builder().flush_interval(None).build(),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(cache.cached_entries(), 0);
    assert_eq!(cache.read(7).unwrap(), Some(7));
}
