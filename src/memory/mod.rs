//! Memory Module
//!
//! Cooperative memory accounting shared by independently written layers.
//!
//! ## Responsibilities
//! - Layers register as [`MemoryGobbler`]s: they report their footprint and
//!   can shed it on request
//! - Layers ask the [`MemoryManager`] for the current [`MemoryStatus`] before
//!   growing optional state (cache warm-up, opportunistic caching)
//! - Writers block in `wait_for_sufficient_memory` instead of queueing
//!   unboundedly
//!
//! The manager is injected into each layer; one instance is normally shared
//! by the whole process.

mod budget;

use std::sync::Weak;
use std::time::Duration;

pub use budget::BudgetMemoryManager;

/// Coarse memory pressure level, ordered from no pressure to most pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryStatus {
    Free,
    SomewhatLow,
    Low,
    Critical,
}

impl MemoryStatus {
    /// Writers may proceed
    pub fn is_sufficient(self) -> bool {
        self < MemoryStatus::Low
    }
}

/// A component that holds reclaimable memory
pub trait MemoryGobbler: Send + Sync {
    fn gobbler_name(&self) -> &str;

    /// Estimated bytes currently held
    fn estimated_memory_usage(&self) -> u64;

    /// Release as much as possible right now; returns the bytes freed
    fn free_memory_now(&self) -> u64;
}

/// Process-wide memory coordination
pub trait MemoryManager: Send + Sync {
    /// Register a gobbler. Only a weak reference is kept: dropping the
    /// gobbler unregisters it.
    fn register_gobbler(&self, gobbler: Weak<dyn MemoryGobbler>);

    fn current_memory_status(&self) -> MemoryStatus;

    /// Block until memory is sufficient or `max_wait` elapsed.
    /// Returns whether memory is sufficient.
    fn wait_for_sufficient_memory(&self, max_wait: Duration) -> bool;
}
