//! Budget-based memory manager
//!
//! Compares the summed footprint of registered gobblers (plus any usage
//! reported from outside) against a fixed byte budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{MemoryGobbler, MemoryManager, MemoryStatus};

/// Default sleep between memory checks while a writer is blocked
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Memory manager enforcing a byte budget
///
/// | usage / budget | status        |
/// |----------------|---------------|
/// | < 50 %         | `Free`        |
/// | < 75 %         | `SomewhatLow` |
/// | < 90 %         | `Low`         |
/// | otherwise      | `Critical`    |
pub struct BudgetMemoryManager {
    /// `None` means unbounded: always `Free`
    budget_bytes: Option<u64>,
    poll_interval: Duration,
    gobblers: Mutex<Vec<Weak<dyn MemoryGobbler>>>,
    /// Usage held by things that are not gobblers
    external_usage: AtomicU64,
}

impl BudgetMemoryManager {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: Some(budget_bytes),
            poll_interval: DEFAULT_POLL_INTERVAL,
            gobblers: Mutex::new(Vec::new()),
            external_usage: AtomicU64::new(0),
        }
    }

    /// A manager that never reports pressure
    pub fn unbounded() -> Self {
        Self {
            budget_bytes: None,
            ..Self::new(0)
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Report memory held outside any registered gobbler
    pub fn set_external_usage(&self, bytes: u64) {
        self.external_usage.store(bytes, Ordering::Relaxed);
    }

    /// Live gobblers; dead registrations are pruned
    fn live_gobblers(&self) -> Vec<Arc<dyn MemoryGobbler>> {
        let mut gobblers = self.gobblers.lock();
        gobblers.retain(|g| g.strong_count() > 0);
        gobblers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Total estimated usage in bytes
    pub fn total_usage(&self) -> u64 {
        let gobbled: u64 = self
            .live_gobblers()
            .iter()
            .map(|g| g.estimated_memory_usage())
            .sum();
        gobbled.saturating_add(self.external_usage.load(Ordering::Relaxed))
    }

    pub fn gobbler_count(&self) -> usize {
        self.live_gobblers().len()
    }

    fn status_for(&self, usage: u64) -> MemoryStatus {
        let budget = match self.budget_bytes {
            Some(budget) => budget.max(1),
            None => return MemoryStatus::Free,
        };
        let ratio = usage as f64 / budget as f64;
        if ratio < 0.50 {
            MemoryStatus::Free
        } else if ratio < 0.75 {
            MemoryStatus::SomewhatLow
        } else if ratio < 0.90 {
            MemoryStatus::Low
        } else {
            MemoryStatus::Critical
        }
    }

    /// Ask gobblers, biggest first, to shed memory until status recovers
    fn reclaim(&self) -> u64 {
        let mut gobblers: Vec<_> = self
            .live_gobblers()
            .into_iter()
            .map(|g| (g.estimated_memory_usage(), g))
            .collect();
        gobblers.sort_by(|a, b| b.0.cmp(&a.0));

        let mut freed = 0u64;
        for (usage, gobbler) in gobblers {
            if usage == 0 || self.current_memory_status().is_sufficient() {
                break;
            }
            let bytes = gobbler.free_memory_now();
            tracing::debug!(
                gobbler = gobbler.gobbler_name(),
                freed_bytes = bytes,
                "Reclaimed memory from gobbler"
            );
            freed += bytes;
        }
        freed
    }
}

impl MemoryManager for BudgetMemoryManager {
    fn register_gobbler(&self, gobbler: Weak<dyn MemoryGobbler>) {
        self.gobblers.lock().push(gobbler);
    }

    fn current_memory_status(&self) -> MemoryStatus {
        if self.budget_bytes.is_none() {
            return MemoryStatus::Free;
        }
        self.status_for(self.total_usage())
    }

    fn wait_for_sufficient_memory(&self, max_wait: Duration) -> bool {
        if self.current_memory_status().is_sufficient() {
            return true;
        }

        let deadline = Instant::now() + max_wait;
        self.reclaim();

        loop {
            if self.current_memory_status().is_sufficient() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    waited_ms = max_wait.as_millis() as u64,
                    usage = self.total_usage(),
                    "Memory still low after waiting"
                );
                return false;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
